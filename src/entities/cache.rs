//! Per-fragment memo of the transformed raster and its bounding box.
//!
//! **Why**: warping a multi-megapixel slide on every read would stall
//! interactive dragging. The cache keeps exactly one transformed raster per
//! fragment (LOD variants live in the render layer, see `render::lod_cache`).
//!
//! Contract:
//! - `invalidate()` is called by every transform mutator before it returns
//! - `is_valid()` stays false until the next read recomputes
//! - the raster is keyed by `(rotation, flips)`: a translation-only change
//!   re-derives the bounding box but reuses the raster

use log::trace;

use super::image::ImageBuffer;
use super::transform::{BoundingBox, RasterKey, RigidTransform, warp_image};

#[derive(Debug, Clone, Default)]
pub struct TransformCache {
    image: Option<(RasterKey, ImageBuffer)>,
    bbox: Option<BoundingBox>,
    valid: bool,
    /// Bumped on every invalidation
    generation: u64,
    /// Number of raster warps performed (observability/tests)
    recomputes: u64,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn recompute_count(&self) -> u64 {
        self.recomputes
    }

    /// Mark derived data stale.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.bbox = None;
        self.generation += 1;
    }

    /// Bring cached data in line with `transform`, warping only if needed.
    fn refresh(&mut self, raw: &ImageBuffer, transform: &RigidTransform) {
        if self.valid {
            return;
        }
        let key = transform.raster_key();
        let reuse = matches!(&self.image, Some((cached, _)) if *cached == key);
        if !reuse {
            trace!(
                "TransformCache: warping {}x{} (rot={:.3}, flip_h={}, flip_v={})",
                raw.width(),
                raw.height(),
                transform.rotation,
                transform.flip_horizontal,
                transform.flip_vertical
            );
            self.image = Some((key, warp_image(raw, transform)));
            self.recomputes += 1;
        }
        let (w, h) = raw.resolution();
        self.bbox = Some(transform.bounding_box(w, h));
        self.valid = true;
    }

    /// Transformed raster for the current transform (lazy recompute).
    pub fn image(&mut self, raw: &ImageBuffer, transform: &RigidTransform) -> ImageBuffer {
        self.refresh(raw, transform);
        match &self.image {
            Some((_, img)) => img.clone(),
            None => ImageBuffer::empty(),
        }
    }

    /// World bounding box for the current transform (lazy recompute).
    pub fn bbox(&mut self, raw: &ImageBuffer, transform: &RigidTransform) -> BoundingBox {
        self.refresh(raw, transform);
        match self.bbox {
            Some(b) => b,
            None => transform.bounding_box(raw.width(), raw.height()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_then_recompute() {
        let raw = ImageBuffer::filled(4, 2, [1, 2, 3, 255]);
        let mut t = RigidTransform::identity();
        let mut cache = TransformCache::new();
        assert!(!cache.is_valid());

        let img = cache.image(&raw, &t);
        assert!(cache.is_valid());
        assert_eq!(img.resolution(), (4, 2));
        assert_eq!(cache.recompute_count(), 1);

        t.rotation = 90.0;
        cache.invalidate();
        assert!(!cache.is_valid());
        assert_eq!(cache.image(&raw, &t).resolution(), (2, 4));
        assert_eq!(cache.recompute_count(), 2);
    }

    #[test]
    fn test_translation_reuses_raster() {
        let raw = ImageBuffer::filled(4, 2, [1, 2, 3, 255]);
        let mut t = RigidTransform::identity();
        let mut cache = TransformCache::new();
        cache.image(&raw, &t);

        t.x = 25.0;
        cache.invalidate();
        assert!(!cache.is_valid());
        assert_eq!(cache.bbox(&raw, &t), BoundingBox::new(25.0, 0.0, 4.0, 2.0));
        assert!(cache.is_valid());
        assert_eq!(cache.recompute_count(), 1);
    }

    #[test]
    fn test_generation_bumps() {
        let mut cache = TransformCache::new();
        let g0 = cache.generation();
        cache.invalidate();
        cache.invalidate();
        assert_eq!(cache.generation(), g0 + 2);
    }
}
