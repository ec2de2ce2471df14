//! Raw fragment rasters (8-bit RGB / RGBA)
//!
//! **Why**: scanned slides come as 3-channel (TIFF/JPEG) or 4-channel (PNG)
//! rasters. The buffer is immutable after creation and shared through `Arc`,
//! so worker snapshots and cached rasters are cheap clones, never copies.
//!
//! **Used by**: Fragment (raw content + transformed raster), render workers
//! (LOD downscale), stitcher (luma planes), compositor.

use rayon::prelude::*;
use std::sync::Arc;

use super::error::FragmentError;

/// Pixel format of an [`ImageBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,  // 3 bytes/pixel, opaque
    Rgba8, // 4 bytes/pixel, straight alpha
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Immutable `height x width x channels` raster.
#[derive(Clone)]
pub struct ImageBuffer {
    pixels: Arc<Vec<u8>>,
    width: usize,
    height: usize,
    format: PixelFormat,
}

impl std::fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

impl PartialEq for ImageBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.format == other.format
            && (Arc::ptr_eq(&self.pixels, &other.pixels) || self.pixels == other.pixels)
    }
}

impl ImageBuffer {
    /// Wrap a raw pixel vector, checking its length against the dimensions.
    pub fn new(
        pixels: Vec<u8>,
        width: usize,
        height: usize,
        format: PixelFormat,
    ) -> Result<Self, FragmentError> {
        let expected = width * height * format.channels();
        if pixels.len() != expected {
            return Err(FragmentError::InvalidImage(format!(
                "buffer has {} bytes, {}x{} {:?} needs {}",
                pixels.len(),
                width,
                height,
                format,
                expected
            )));
        }
        Ok(Self {
            pixels: Arc::new(pixels),
            width,
            height,
            format,
        })
    }

    pub fn from_rgba8(pixels: Vec<u8>, width: usize, height: usize) -> Result<Self, FragmentError> {
        Self::new(pixels, width, height, PixelFormat::Rgba8)
    }

    pub fn from_rgb8(pixels: Vec<u8>, width: usize, height: usize) -> Result<Self, FragmentError> {
        Self::new(pixels, width, height, PixelFormat::Rgb8)
    }

    /// Solid RGBA raster
    pub fn filled(width: usize, height: usize, rgba: [u8; 4]) -> Self {
        let mut pixels = vec![0u8; width * height * 4];
        for px in pixels.chunks_mut(4) {
            px.copy_from_slice(&rgba);
        }
        Self {
            pixels: Arc::new(pixels),
            width,
            height,
            format: PixelFormat::Rgba8,
        }
    }

    /// Zero-sized raster (stands for "no content")
    pub fn empty() -> Self {
        Self {
            pixels: Arc::new(Vec::new()),
            width: 0,
            height: 0,
            format: PixelFormat::Rgba8,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Memory footprint in bytes
    pub fn mem(&self) -> usize {
        self.pixels.len()
    }

    /// RGBA value at `(x, y)`; RGB sources report alpha 255.
    ///
    /// Panics if out of bounds (callers iterate within `resolution()`).
    #[inline]
    pub fn rgba_at(&self, x: usize, y: usize) -> [u8; 4] {
        let c = self.channels();
        let idx = (y * self.width + x) * c;
        let p = &self.pixels[idx..idx + c];
        if c == 4 {
            [p[0], p[1], p[2], p[3]]
        } else {
            [p[0], p[1], p[2], 255]
        }
    }

    /// Expand to an RGBA8 byte vector (copy).
    pub fn to_rgba8_vec(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Rgba8 => self.pixels.as_ref().clone(),
            PixelFormat::Rgb8 => {
                let mut out = Vec::with_capacity(self.width * self.height * 4);
                for px in self.pixels.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                out
            }
        }
    }

    /// Rec.601 luma plane; pixels with alpha below 128 become `NaN`.
    ///
    /// The NaN marks propagate through bilinear sampling, so a sample that
    /// touches a transparent pixel is rejected by the scorer.
    pub fn luma_masked(&self) -> Vec<f32> {
        let c = self.channels();
        self.pixels
            .chunks_exact(c)
            .map(|p| {
                if c == 4 && p[3] < 128 {
                    f32::NAN
                } else {
                    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
                }
            })
            .collect()
    }

    /// Area-averaged downscale (box filter), used for level-of-detail rasters.
    ///
    /// `scale >= 1.0` returns a cheap clone. Output keeps the input format.
    pub fn downscale(&self, scale: f32) -> Self {
        if scale >= 1.0 || self.is_empty() {
            return self.clone();
        }
        let dst_w = ((self.width as f32 * scale) as usize).max(1);
        let dst_h = ((self.height as f32 * scale) as usize).max(1);
        let c = self.channels();
        let fx = self.width as f32 / dst_w as f32;
        let fy = self.height as f32 / dst_h as f32;
        let src = &self.pixels;
        let src_w = self.width;
        let src_h = self.height;

        let mut dst = vec![0u8; dst_w * dst_h * c];
        dst.par_chunks_mut(dst_w * c)
            .enumerate()
            .for_each(|(y, row)| {
                let y0 = (y as f32 * fy) as usize;
                let y1 = (((y + 1) as f32 * fy) as usize).clamp(y0 + 1, src_h);
                for x in 0..dst_w {
                    let x0 = (x as f32 * fx) as usize;
                    let x1 = (((x + 1) as f32 * fx) as usize).clamp(x0 + 1, src_w);
                    let mut acc = [0u32; 4];
                    for sy in y0..y1 {
                        for sx in x0..x1 {
                            let idx = (sy * src_w + sx) * c;
                            for ch in 0..c {
                                acc[ch] += src[idx + ch] as u32;
                            }
                        }
                    }
                    let n = ((y1 - y0) * (x1 - x0)) as u32;
                    for ch in 0..c {
                        row[x * c + ch] = ((acc[ch] + n / 2) / n) as u8;
                    }
                }
            });

        Self {
            pixels: Arc::new(dst),
            width: dst_w,
            height: dst_h,
            format: self.format,
        }
    }
}
