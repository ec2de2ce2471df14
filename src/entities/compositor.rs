//! Fragment compositor - flattens visible fragments into one RGBA raster.
//!
//! Canvas covers the union of visible bounding boxes (snapped outward to
//! whole pixels). Layers are blended bottom-to-top in z-order with the
//! straight-alpha "over" operator, scaled by fragment opacity. Rows are
//! blended in parallel with rayon.

use rayon::prelude::*;

use super::fragment::Fragment;
use super::image::ImageBuffer;
use super::transform::BoundingBox;

/// CPU compositor for fragment stacks.
#[derive(Clone, Debug, Default)]
pub struct CpuCompositor;

impl CpuCompositor {
    /// Blend one RGBA pixel run `top` over `bottom` in place.
    fn blend_u8(bottom: &mut [u8], top: &[u8], opacity: f32) {
        debug_assert_eq!(bottom.len(), top.len());

        for i in (0..bottom.len()).step_by(4) {
            let top_alpha = (top[i + 3] as f32 / 255.0) * opacity;
            if top_alpha <= 0.0 {
                continue;
            }
            let bottom_alpha = bottom[i + 3] as f32 / 255.0;
            let out_a = top_alpha + bottom_alpha * (1.0 - top_alpha);

            for c in 0..3 {
                let t = top[i + c] as f32;
                let b = bottom[i + c] as f32;
                let v = (t * top_alpha + b * bottom_alpha * (1.0 - top_alpha)) / out_a;
                bottom[i + c] = v.round().clamp(0.0, 255.0) as u8;
            }
            bottom[i + 3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }

    /// Flatten `layers` (bottom first) onto a canvas whose top-left is `origin`.
    ///
    /// Each layer is an RGBA raster placed at its bounding box, with opacity.
    pub fn blend_layers(
        &self,
        layers: &[(ImageBuffer, BoundingBox, f32)],
        origin: (i64, i64),
        dim: (usize, usize),
    ) -> Option<ImageBuffer> {
        let (width, height) = dim;
        if width == 0 || height == 0 {
            return None;
        }
        let mut canvas = vec![0u8; width * height * 4];

        for (image, bbox, opacity) in layers {
            let (lw, lh) = image.resolution();
            if lw == 0 || lh == 0 || *opacity <= 0.0 {
                continue;
            }
            let rgba = image.to_rgba8_vec();
            let off_x = bbox.x.round() as i64 - origin.0;
            let off_y = bbox.y.round() as i64 - origin.1;

            // Horizontal span of the layer clipped to the canvas
            let x0 = off_x.max(0) as usize;
            let x1 = (off_x + lw as i64).clamp(0, width as i64) as usize;
            if x0 >= x1 {
                continue;
            }
            let src_x0 = (x0 as i64 - off_x) as usize;

            canvas
                .par_chunks_mut(width * 4)
                .enumerate()
                .for_each(|(y, row)| {
                    let src_y = y as i64 - off_y;
                    if src_y < 0 || src_y >= lh as i64 {
                        return;
                    }
                    let src_row = src_y as usize * lw * 4;
                    let top = &rgba[src_row + src_x0 * 4..src_row + (src_x0 + x1 - x0) * 4];
                    Self::blend_u8(&mut row[x0 * 4..x1 * 4], top, *opacity);
                });
        }

        ImageBuffer::from_rgba8(canvas, width, height).ok()
    }
}

/// Flatten the visible fragments (given in z-order, bottom first).
///
/// Returns `None` when no visible fragment has content.
pub fn composite(fragments: &[&Fragment]) -> Option<ImageBuffer> {
    let layers: Vec<(ImageBuffer, BoundingBox, f32)> = fragments
        .iter()
        .filter(|f| f.is_visible())
        .filter_map(|f| Some((f.get_transformed_image()?, f.get_bounding_box()?, f.opacity())))
        .collect();

    let bounds = layers.iter().map(|(_, b, _)| *b).reduce(|a, b| a.union(&b))?;
    let x0 = bounds.x.round() as i64;
    let y0 = bounds.y.round() as i64;
    let x1 = bounds.right().round() as i64;
    let y1 = bounds.bottom().round() as i64;
    let dim = ((x1 - x0).max(0) as usize, (y1 - y0).max(0) as usize);

    log::debug!(
        "Compositor: {} layers onto {}x{} canvas at ({}, {})",
        layers.len(),
        dim.0,
        dim.1,
        x0,
        y0
    );
    CpuCompositor.blend_layers(&layers, (x0, y0), dim)
}
