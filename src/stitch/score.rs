//! Pairwise overlap scoring.
//!
//! Metric: normalized cross-correlation of Rec.601 luma over the world-space
//! overlap of two fragments' bounding boxes, damped by overlap size:
//!
//! `score = ncc * area / (area + overlap_half_weight)`
//!
//! `area` is the overlap rectangle scaled by the fraction of grid samples
//! that landed on opaque pixels of both images. Tiny overlaps therefore
//! cannot win on a lucky correlation.

use glam::{DAffine2, DVec2};
use log::trace;

use crate::entities::{BoundingBox, ImageBuffer, RigidTransform};

use super::StitchConfig;

/// Luma plane used for scoring, optionally at reduced resolution.
///
/// Transparent pixels (alpha < 128) are NaN and reject any sample touching them.
#[derive(Debug, Clone)]
pub struct LumaPlane {
    data: Vec<f32>,
    width: usize,
    height: usize,
    /// Raw image size the plane stands for
    raw: (usize, usize),
}

impl LumaPlane {
    /// Build from a raw image, downscaling so the longer side is at most `max_side`.
    pub fn from_image(image: &ImageBuffer, max_side: usize) -> Self {
        let raw = image.resolution();
        let longest = raw.0.max(raw.1);
        let working = if max_side > 0 && longest > max_side {
            image.downscale(max_side as f32 / longest as f32)
        } else {
            image.clone()
        };
        Self {
            data: working.luma_masked(),
            width: working.width(),
            height: working.height(),
            raw,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn raw_size(&self) -> (usize, usize) {
        self.raw
    }

    /// Bilinear sample at a point in RAW pixel coordinates.
    #[inline]
    pub fn sample(&self, q: DVec2) -> Option<f32> {
        let (rw, rh) = (self.raw.0 as f64, self.raw.1 as f64);
        if q.x < 0.0 || q.y < 0.0 || q.x >= rw || q.y >= rh {
            return None;
        }
        let px = q.x * self.width as f64 / rw;
        let py = q.y * self.height as f64 / rh;

        let sx = (px - 0.5).max(0.0);
        let sy = (py - 0.5).max(0.0);
        let x0 = (sx.floor() as usize).min(self.width - 1);
        let y0 = (sy.floor() as usize).min(self.height - 1);
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = (sx - x0 as f64).clamp(0.0, 1.0) as f32;
        let fy = (sy - y0 as f64).clamp(0.0, 1.0) as f32;

        let at = |x: usize, y: usize| self.data[y * self.width + x];
        let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
        let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
        let v = top * (1.0 - fy) + bottom * fy;
        if v.is_nan() { None } else { Some(v) }
    }
}

/// A plane placed in the world by a transform.
pub struct Placed<'a> {
    pub plane: &'a LumaPlane,
    pub inv: DAffine2,
    pub bbox: BoundingBox,
}

impl<'a> Placed<'a> {
    pub fn new(plane: &'a LumaPlane, transform: &RigidTransform) -> Self {
        let (w, h) = plane.raw_size();
        Self {
            plane,
            inv: transform.to_local(w, h),
            bbox: transform.bounding_box(w, h),
        }
    }
}

/// Score two placed planes. Zero for no overlap or too few valid samples.
pub fn pair_score(a: &Placed<'_>, b: &Placed<'_>, config: &StitchConfig) -> f64 {
    let Some(overlap) = a.bbox.intersection(&b.bbox) else {
        return 0.0;
    };

    // Grid stride so the sample count stays under the cap
    let max_samples = config.max_samples.max(1) as f64;
    let stride = (overlap.area() / max_samples).sqrt().max(1.0);
    let nx = (overlap.width / stride).ceil().max(1.0) as usize;
    let ny = (overlap.height / stride).ceil().max(1.0) as usize;

    let (mut n, mut sa, mut sb, mut saa, mut sbb, mut sab) = (0usize, 0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for j in 0..ny {
        let y = overlap.y + (j as f64 + 0.5) * stride;
        if y >= overlap.bottom() {
            break;
        }
        for i in 0..nx {
            let x = overlap.x + (i as f64 + 0.5) * stride;
            if x >= overlap.right() {
                break;
            }
            let p = DVec2::new(x, y);
            let (Some(va), Some(vb)) = (
                a.plane.sample(a.inv.transform_point2(p)),
                b.plane.sample(b.inv.transform_point2(p)),
            ) else {
                continue;
            };
            let (va, vb) = (va as f64, vb as f64);
            n += 1;
            sa += va;
            sb += vb;
            saa += va * va;
            sbb += vb * vb;
            sab += va * vb;
        }
    }

    if n < config.min_overlap_samples.max(2) {
        return 0.0;
    }
    let nf = n as f64;
    let var_a = saa - sa * sa / nf;
    let var_b = sbb - sb * sb / nf;
    let cov = sab - sa * sb / nf;
    // Flat regions carry no alignment information
    if var_a <= 1e-6 * nf || var_b <= 1e-6 * nf {
        return 0.0;
    }
    let ncc = cov / (var_a * var_b).sqrt();
    if !ncc.is_finite() {
        return 0.0;
    }

    let area = overlap.area() * (nf / (nx * ny) as f64).min(1.0);
    let score = ncc * area / (area + config.overlap_half_weight.max(0.0));
    trace!("pair_score: n={} ncc={:.4} area={:.1} score={:.4}", n, ncc, area, score);
    score
}
