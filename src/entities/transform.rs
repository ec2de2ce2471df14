//! Rigid 2D transforms for fragment placement.
//!
//! Uses glam::DAffine2 for point math in Y-down world space.
//! Forward transform (local raw pixel -> world):
//! world = translation + half(out_size) + R * (flip(local) - half(raw_size))
//!
//! Rotation sign: clockwise-positive on screen (user convention), degrees.
//! Flip mirrors about the raw image axis before rotation.
//! Translation is the top-left corner of the rotated raster's bounding box.

use glam::{DAffine2, DMat2, DVec2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::image::ImageBuffer;

/// Normalize any angle in degrees into `[0, 360)`.
#[inline]
pub fn normalize_angle(deg: f64) -> f64 {
    if !deg.is_finite() {
        return 0.0;
    }
    let a = deg.rem_euclid(360.0);
    // rem_euclid may round tiny negatives up to exactly 360.0
    if a >= 360.0 { 0.0 } else { a }
}

/// `(sin, cos)` of an angle in degrees, exact at multiples of 90.
///
/// Exact values keep quarter-turn warps pixel-perfect.
#[inline]
pub fn sin_cos_deg(deg: f64) -> (f64, f64) {
    let d = normalize_angle(deg);
    if d == 0.0 {
        (0.0, 1.0)
    } else if d == 90.0 {
        (1.0, 0.0)
    } else if d == 180.0 {
        (0.0, -1.0)
    } else if d == 270.0 {
        (-1.0, 0.0)
    } else {
        d.to_radians().sin_cos()
    }
}

/// Size of the axis-aligned raster enclosing a `w x h` image rotated by `deg`.
pub fn rotated_size(w: usize, h: usize, deg: f64) -> (usize, usize) {
    if w == 0 || h == 0 {
        return (0, 0);
    }
    let (s, c) = sin_cos_deg(deg);
    let (wf, hf) = (w as f64, h as f64);
    let out_w = (wf * c.abs() + hf * s.abs() - 1e-9).ceil().max(1.0);
    let out_h = (wf * s.abs() + hf * c.abs() - 1e-9).ceil().max(1.0);
    (out_w as usize, out_h as usize)
}

/// Cache key of a transformed raster: everything except translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterKey {
    rotation_bits: u64,
    flip_horizontal: bool,
    flip_vertical: bool,
}

/// Rotation + translation + mirror flags of one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    /// Degrees, clockwise-positive, kept in `[0, 360)`
    pub rotation: f64,
    /// World x of the bounding box top-left
    pub x: f64,
    /// World y of the bounding box top-left
    pub y: f64,
    pub flip_horizontal: bool,
    #[serde(default)]
    pub flip_vertical: bool,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    pub const fn identity() -> Self {
        Self {
            rotation: 0.0,
            x: 0.0,
            y: 0.0,
            flip_horizontal: false,
            flip_vertical: false,
        }
    }

    /// Build with the rotation normalized.
    pub fn new(rotation: f64, x: f64, y: f64, flip_horizontal: bool) -> Self {
        Self {
            rotation: normalize_angle(rotation),
            x,
            y,
            flip_horizontal,
            flip_vertical: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Same transform with the rotation folded into `[0, 360)`.
    pub fn normalized(mut self) -> Self {
        self.rotation = normalize_angle(self.rotation);
        self
    }

    pub fn translation(&self) -> DVec2 {
        DVec2::new(self.x, self.y)
    }

    pub fn raster_key(&self) -> RasterKey {
        RasterKey {
            rotation_bits: normalize_angle(self.rotation).to_bits(),
            flip_horizontal: self.flip_horizontal,
            flip_vertical: self.flip_vertical,
        }
    }

    /// Transformed raster size for a `w x h` source.
    pub fn output_size(&self, w: usize, h: usize) -> (usize, usize) {
        rotated_size(w, h, self.rotation)
    }

    /// Local (raw pixel space) -> world mapping for a `w x h` source.
    pub fn to_world(&self, w: usize, h: usize) -> DAffine2 {
        let (out_w, out_h) = self.output_size(w, h);
        let (s, c) = sin_cos_deg(self.rotation);
        let rot = DMat2::from_cols(DVec2::new(c, s), DVec2::new(-s, c));

        let (wf, hf) = (w as f64, h as f64);
        let flip = DAffine2::from_cols(
            DVec2::new(if self.flip_horizontal { -1.0 } else { 1.0 }, 0.0),
            DVec2::new(0.0, if self.flip_vertical { -1.0 } else { 1.0 }),
            DVec2::new(
                if self.flip_horizontal { wf } else { 0.0 },
                if self.flip_vertical { hf } else { 0.0 },
            ),
        );

        let out_half = DVec2::new(out_w as f64 * 0.5, out_h as f64 * 0.5);
        DAffine2::from_translation(self.translation() + out_half)
            * DAffine2::from_mat2(rot)
            * DAffine2::from_translation(DVec2::new(-wf * 0.5, -hf * 0.5))
            * flip
    }

    /// World -> local mapping (inverse of [`Self::to_world`]).
    pub fn to_local(&self, w: usize, h: usize) -> DAffine2 {
        self.to_world(w, h).inverse()
    }

    /// World-space AABB for a `w x h` source.
    pub fn bounding_box(&self, w: usize, h: usize) -> BoundingBox {
        let (out_w, out_h) = self.output_size(w, h);
        BoundingBox::new(self.x, self.y, out_w as f64, out_h as f64)
    }

    /// World-space center of the image.
    pub fn center(&self, w: usize, h: usize) -> DVec2 {
        let (out_w, out_h) = self.output_size(w, h);
        self.translation() + DVec2::new(out_w as f64 * 0.5, out_h as f64 * 0.5)
    }

    /// Rotate by `delta` degrees keeping the world-space center in place.
    ///
    /// The bounding box grows or shrinks with the angle, so the top-left
    /// translation is re-derived from the preserved center.
    pub fn rotated_about_center(&self, delta: f64, w: usize, h: usize) -> Self {
        self.rotated_about(delta, self.center(w, h), w, h)
    }

    /// Rotate by `delta` degrees about a world-space pivot; the image point
    /// under `pivot` stays under it.
    pub fn rotated_about(&self, delta: f64, pivot: DVec2, w: usize, h: usize) -> Self {
        let (s, c) = sin_cos_deg(delta);
        let d = self.center(w, h) - pivot;
        let center = pivot + DVec2::new(c * d.x - s * d.y, s * d.x + c * d.y);
        let rotation = normalize_angle(self.rotation + delta);
        let (out_w, out_h) = rotated_size(w, h, rotation);
        Self {
            rotation,
            x: center.x - out_w as f64 * 0.5,
            y: center.y - out_h as f64 * 0.5,
            ..*self
        }
    }
}

/// Axis-aligned rectangle in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    /// Overlap rectangle, `None` unless the area is positive.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 > x0 && y1 > y0 {
            Some(Self::new(x0, y0, x1 - x0, y1 - y0))
        } else {
            None
        }
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.intersection(other).is_some()
    }

    pub fn union(&self, other: &Self) -> Self {
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        Self::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// Bilinear RGBA sample at a local point (pixel centers at `i + 0.5`).
///
/// Returns transparent if the point lies outside `[0, w) x [0, h)`.
#[inline]
fn sample_rgba(src: &ImageBuffer, q: DVec2) -> [f32; 4] {
    let (w, h) = src.resolution();
    if q.x < 0.0 || q.y < 0.0 || q.x >= w as f64 || q.y >= h as f64 {
        return [0.0; 4];
    }

    let sx = (q.x - 0.5).max(0.0);
    let sy = (q.y - 0.5).max(0.0);
    let x0 = (sx.floor() as usize).min(w - 1);
    let y0 = (sy.floor() as usize).min(h - 1);
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = (sx - x0 as f64).clamp(0.0, 1.0) as f32;
    let fy = (sy - y0 as f64).clamp(0.0, 1.0) as f32;

    let c00 = src.rgba_at(x0, y0);
    let c10 = src.rgba_at(x1, y0);
    let c01 = src.rgba_at(x0, y1);
    let c11 = src.rgba_at(x1, y1);

    let mut result = [0.0f32; 4];
    for c in 0..4 {
        let top = c00[c] as f32 * (1.0 - fx) + c10[c] as f32 * fx;
        let bottom = c01[c] as f32 * (1.0 - fx) + c11[c] as f32 * fx;
        result[c] = top * (1.0 - fy) + bottom * fy;
    }
    result
}

/// Flip then rotate a raster about its center.
///
/// Output is always RGBA8 sized to the rotated bounding box; uncovered
/// corners are transparent. Translation is ignored (placement is done by the
/// bounding box). Rows are processed in parallel with rayon.
pub fn warp_image(src: &ImageBuffer, transform: &RigidTransform) -> ImageBuffer {
    if src.is_empty() {
        return ImageBuffer::empty();
    }
    let (src_w, src_h) = src.resolution();
    let placed = RigidTransform {
        x: 0.0,
        y: 0.0,
        ..*transform
    };
    let (dst_w, dst_h) = placed.output_size(src_w, src_h);
    let inv = placed.to_local(src_w, src_h);

    let mut dst = vec![0u8; dst_w * dst_h * 4];
    dst.par_chunks_mut(dst_w * 4)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..dst_w {
                let dst_pt = DVec2::new(x as f64 + 0.5, y as f64 + 0.5);
                let color = sample_rgba(src, inv.transform_point2(dst_pt));
                let idx = x * 4;
                for c in 0..4 {
                    row[idx + c] = color[c].round().clamp(0.0, 255.0) as u8;
                }
            }
        });

    // Length matches by construction
    ImageBuffer::from_rgba8(dst, dst_w, dst_h).unwrap_or_else(|_| ImageBuffer::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: usize, h: usize) -> ImageBuffer {
        let mut px = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                px.extend_from_slice(&[(x * 10) as u8, (y * 10) as u8, ((x + y) * 5) as u8]);
            }
        }
        ImageBuffer::from_rgb8(px, w, h).unwrap()
    }

    #[test]
    fn test_normalize_angle() {
        assert_eq!(normalize_angle(-450.0), 270.0);
        assert_eq!(normalize_angle(720.0), 0.0);
        assert_eq!(normalize_angle(-90.0), 270.0);
        assert_eq!(normalize_angle(359.5), 359.5);
        assert_eq!(normalize_angle(-1e-20), 0.0);
        assert_eq!(normalize_angle(f64::NAN), 0.0);
    }

    #[test]
    fn test_rotated_size() {
        assert_eq!(rotated_size(100, 50, 0.0), (100, 50));
        assert_eq!(rotated_size(100, 50, 90.0), (50, 100));
        assert_eq!(rotated_size(100, 50, 180.0), (100, 50));
        // 45deg square grows to w*sqrt(2)
        assert_eq!(rotated_size(100, 100, 45.0), (142, 142));
    }

    #[test]
    fn test_identity_roundtrip_points() {
        let t = RigidTransform::new(33.0, 12.5, -4.0, true);
        let fwd = t.to_world(40, 20);
        let inv = t.to_local(40, 20);
        let q = DVec2::new(7.25, 3.5);
        let back = inv.transform_point2(fwd.transform_point2(q));
        assert!((back - q).length() < 1e-9);
    }

    #[test]
    fn test_center_is_fixed_point_of_rotation() {
        let t = RigidTransform::new(0.0, 10.0, 20.0, false);
        let c_before = t.center(30, 10);
        let r = t.rotated_about_center(90.0, 30, 10);
        assert_eq!(r.rotation, 90.0);
        assert!((r.center(30, 10) - c_before).length() < 1e-9);
        assert_eq!(r.bounding_box(30, 10).width, 10.0);
    }

    #[test]
    fn test_pivot_keeps_its_image_point() {
        let t = RigidTransform::new(10.0, 5.0, -3.0, true);
        let pivot = DVec2::new(12.0, 40.0);
        let before = t.to_local(30, 50).transform_point2(pivot);
        let r = t.rotated_about(-7.5, pivot, 30, 50);
        assert_eq!(r.rotation, 2.5);
        assert!(r.flip_horizontal);
        let after = r.to_local(30, 50).transform_point2(pivot);
        assert!((after - before).length() < 1e-9, "{:?} vs {:?}", after, before);
    }

    #[test]
    fn test_warp_identity_is_rgba_copy() {
        let img = gradient(5, 3);
        let out = warp_image(&img, &RigidTransform::identity());
        assert_eq!(out.resolution(), (5, 3));
        assert_eq!(out.pixels(), &img.to_rgba8_vec()[..]);
    }

    #[test]
    fn test_warp_quarter_turn_maps_corners() {
        let img = gradient(4, 2);
        let out = warp_image(&img, &RigidTransform::new(90.0, 0.0, 0.0, false));
        assert_eq!(out.resolution(), (2, 4));
        // Clockwise: source bottom-left lands at output top-left
        assert_eq!(out.rgba_at(0, 0), img.rgba_at(0, 1));
        assert_eq!(out.rgba_at(1, 0), img.rgba_at(0, 0));
        assert_eq!(out.rgba_at(1, 3), img.rgba_at(3, 0));
    }

    #[test]
    fn test_warp_flip_mirrors_columns() {
        let img = gradient(4, 2);
        let mut t = RigidTransform::identity();
        t.flip_horizontal = true;
        let out = warp_image(&img, &t);
        for y in 0..2 {
            for x in 0..4 {
                assert_eq!(out.rgba_at(x, y), img.rgba_at(3 - x, y));
            }
        }
    }

    #[test]
    fn test_warp_free_rotation_has_transparent_corners() {
        let img = ImageBuffer::filled(20, 20, [200, 50, 50, 255]);
        let out = warp_image(&img, &RigidTransform::new(45.0, 0.0, 0.0, false));
        assert_eq!(out.rgba_at(0, 0)[3], 0);
        let (w, h) = out.resolution();
        assert_eq!(out.rgba_at(w / 2, h / 2), [200, 50, 50, 255]);
    }

    #[test]
    fn test_bbox_intersection() {
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BoundingBox::new(80.0, 10.0, 100.0, 100.0);
        let i = a.intersection(&b).unwrap();
        assert_eq!(i, BoundingBox::new(80.0, 10.0, 20.0, 90.0));
        let c = BoundingBox::new(100.0, 0.0, 10.0, 10.0);
        assert!(!a.intersects(&c)); // touching edges do not overlap
        assert_eq!(a.union(&c), BoundingBox::new(0.0, 0.0, 110.0, 100.0));
    }
}
