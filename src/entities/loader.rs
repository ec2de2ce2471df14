//! Image file I/O over the `image` crate.
//!
//! Any decodable format loads as RGB8 or RGBA8 (alpha kept only when the
//! source has it). Batch loading never aborts on one bad file: failures are
//! collected in [`LoadReport`] and the rest is ingested.

use log::{debug, info, warn};
use std::path::{Path, PathBuf};

use super::error::FragmentError;
use super::fragment::FragmentId;
use super::image::{ImageBuffer, PixelFormat};
use super::manager::FragmentManager;

/// Decode an image file into a raw fragment raster.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<ImageBuffer, FragmentError> {
    let path = path.as_ref();
    debug!("Loading image: {}", path.display());

    let img = image::open(path)?;
    let width = img.width() as usize;
    let height = img.height() as usize;
    if width == 0 || height == 0 {
        return Err(FragmentError::InvalidImage(format!("{} is empty", path.display())));
    }

    if img.color().has_alpha() {
        ImageBuffer::from_rgba8(img.to_rgba8().into_raw(), width, height)
    } else {
        ImageBuffer::from_rgb8(img.to_rgb8().into_raw(), width, height)
    }
}

/// Encode a raster; format follows the file extension.
///
/// JPEG has no alpha channel, so RGBA input is flattened to RGB first.
pub fn save_image<P: AsRef<Path>>(image: &ImageBuffer, path: P) -> Result<(), FragmentError> {
    let path = path.as_ref();
    if image.is_empty() {
        return Err(FragmentError::InvalidImage("nothing to save".to_string()));
    }
    let format = image::ImageFormat::from_path(path)?;
    let (w, h) = (image.width() as u32, image.height() as u32);

    let dynamic = match image.format() {
        PixelFormat::Rgba8 => image::RgbaImage::from_raw(w, h, image.pixels().to_vec())
            .map(image::DynamicImage::ImageRgba8),
        PixelFormat::Rgb8 => image::RgbImage::from_raw(w, h, image.pixels().to_vec())
            .map(image::DynamicImage::ImageRgb8),
    }
    .ok_or_else(|| FragmentError::InvalidImage("buffer size mismatch".to_string()))?;

    let dynamic = if format == image::ImageFormat::Jpeg {
        image::DynamicImage::ImageRgb8(dynamic.to_rgb8())
    } else {
        dynamic
    };
    dynamic.save_with_format(path, format)?;
    debug!("Saved {}x{} image to {}", w, h, path.display());
    Ok(())
}

/// Outcome of a batch load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<(PathBuf, FragmentId)>,
    pub failed: Vec<(PathBuf, FragmentError)>,
}

impl LoadReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Load every path into `manager`, labelling fragments by file name.
pub fn load_into<I, P>(manager: &mut FragmentManager, paths: I) -> LoadReport
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut report = LoadReport::default();
    for path in paths {
        let path = path.as_ref();
        match load_image(path) {
            Ok(image) => {
                let label = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let id = manager.add_fragment_from_image(image, label);
                report.loaded.push((path.to_path_buf(), id));
            }
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                report.failed.push((path.to_path_buf(), e));
            }
        }
    }
    info!(
        "Loaded {} fragment(s), {} failed",
        report.loaded.len(),
        report.failed.len()
    );
    report
}
