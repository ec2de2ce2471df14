//! Fragment: one scanned tissue image plus its rigid placement.
//!
//! Holds immutable raw content, mutable transform/display state and a
//! per-fragment [`TransformCache`]. Reads (`get_transformed_image`,
//! `get_bounding_box`) take `&self`; the cache sits behind a mutex so the
//! manager can hand out shared references while derived data stays lazy.
//!
//! A fragment created from an empty raster has no content: queries return
//! `None`/`false` and transform mutators are no-ops reporting `false`.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

use super::cache::TransformCache;
use super::image::ImageBuffer;
use super::transform::{BoundingBox, RigidTransform, normalize_angle};

/// Opaque, immutable fragment identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(Uuid);

impl FragmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for FragmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FragmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable copy of what rendering and stitching need from a fragment.
///
/// Shares the raw pixels (`Arc`) but not the live transform, so a worker
/// holding a snapshot never observes a concurrent drag.
#[derive(Debug, Clone)]
pub struct FragmentSnapshot {
    pub id: FragmentId,
    pub image: ImageBuffer,
    pub transform: RigidTransform,
}

impl FragmentSnapshot {
    pub fn bounding_box(&self) -> BoundingBox {
        let (w, h) = self.image.resolution();
        self.transform.bounding_box(w, h)
    }
}

pub struct Fragment {
    id: FragmentId,
    label: String,
    image: Option<ImageBuffer>,
    transform: RigidTransform,
    opacity: f32,
    visible: bool,
    selected: bool,
    cache: Mutex<TransformCache>,
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("image", &self.image)
            .field("transform", &self.transform)
            .field("opacity", &self.opacity)
            .field("visible", &self.visible)
            .field("selected", &self.selected)
            .finish()
    }
}

impl Clone for Fragment {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            label: self.label.clone(),
            image: self.image.clone(),
            transform: self.transform,
            opacity: self.opacity,
            visible: self.visible,
            selected: self.selected,
            cache: Mutex::new(self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone()),
        }
    }
}

impl Fragment {
    /// Create a fragment with identity transform, fully opaque and visible.
    pub fn new(image: ImageBuffer, label: impl Into<String>) -> Self {
        let label = label.into();
        let image = if image.is_empty() {
            warn!("Fragment '{}' created without image content", label);
            None
        } else {
            Some(image)
        };
        Self {
            id: FragmentId::new(),
            label,
            image,
            transform: RigidTransform::identity(),
            opacity: 1.0,
            visible: true,
            selected: false,
            cache: Mutex::new(TransformCache::new()),
        }
    }

    // === Accessors ===

    pub fn id(&self) -> FragmentId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn image(&self) -> Option<&ImageBuffer> {
        self.image.as_ref()
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    /// Raw (untransformed) size, `(0, 0)` without content
    pub fn raw_size(&self) -> (usize, usize) {
        self.image.as_ref().map(|i| i.resolution()).unwrap_or((0, 0))
    }

    pub fn transform(&self) -> RigidTransform {
        self.transform
    }

    pub fn rotation(&self) -> f64 {
        self.transform.rotation
    }

    pub fn position(&self) -> (f64, f64) {
        (self.transform.x, self.transform.y)
    }

    pub fn flip_horizontal(&self) -> bool {
        self.transform.flip_horizontal
    }

    pub fn flip_vertical(&self) -> bool {
        self.transform.flip_vertical
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    // === Derived data ===

    /// Flipped + rotated raster (RGBA8), `None` without content.
    pub fn get_transformed_image(&self) -> Option<ImageBuffer> {
        let raw = self.image.as_ref()?;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        Some(cache.image(raw, &self.transform))
    }

    /// World AABB of the transformed image, `None` without content.
    pub fn get_bounding_box(&self) -> Option<BoundingBox> {
        let raw = self.image.as_ref()?;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        Some(cache.bbox(raw, &self.transform))
    }

    /// Hit test: inverse-transform the world point into the raw image frame.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        let Some(raw) = self.image.as_ref() else {
            return false;
        };
        let (w, h) = raw.resolution();
        let local = self
            .transform
            .to_local(w, h)
            .transform_point2(glam::DVec2::new(x, y));
        local.x >= 0.0 && local.y >= 0.0 && local.x < w as f64 && local.y < h as f64
    }

    pub fn is_cache_valid(&self) -> bool {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).is_valid()
    }

    /// Invalidation counter; changes whenever any mutator ran.
    pub fn cache_generation(&self) -> u64 {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).generation()
    }

    /// Number of raster warps performed so far.
    pub fn recompute_count(&self) -> u64 {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).recompute_count()
    }

    pub fn snapshot(&self) -> Option<FragmentSnapshot> {
        Some(FragmentSnapshot {
            id: self.id,
            image: self.image.clone()?,
            transform: self.transform,
        })
    }

    // === Mutators ===

    fn invalidate(&mut self) {
        self.cache.get_mut().unwrap_or_else(|e| e.into_inner()).invalidate();
    }

    /// Apply a transform change; no-op (returns false) without content.
    fn mutate_transform(&mut self, f: impl FnOnce(&mut RigidTransform)) -> bool {
        if self.image.is_none() {
            debug!("Fragment {}: transform change ignored, no image content", self.id);
            return false;
        }
        f(&mut self.transform);
        self.transform.rotation = normalize_angle(self.transform.rotation);
        self.invalidate();
        true
    }

    pub fn set_rotation(&mut self, angle: f64) -> bool {
        self.mutate_transform(|t| t.rotation = angle)
    }

    pub fn rotate_by(&mut self, delta: f64) -> bool {
        self.mutate_transform(|t| t.rotation += delta)
    }

    pub fn set_position(&mut self, x: f64, y: f64) -> bool {
        self.mutate_transform(|t| {
            t.x = x;
            t.y = y;
        })
    }

    pub fn translate_by(&mut self, dx: f64, dy: f64) -> bool {
        self.mutate_transform(|t| {
            t.x += dx;
            t.y += dy;
        })
    }

    pub fn set_flip_horizontal(&mut self, flip: bool) -> bool {
        self.mutate_transform(|t| t.flip_horizontal = flip)
    }

    pub fn set_flip_vertical(&mut self, flip: bool) -> bool {
        self.mutate_transform(|t| t.flip_vertical = flip)
    }

    pub fn set_transform(&mut self, transform: RigidTransform) -> bool {
        self.mutate_transform(|t| *t = transform)
    }

    pub fn reset_transform(&mut self) -> bool {
        self.set_transform(RigidTransform::identity())
    }

    /// Clamped to `[0, 1]`; NaN counts as fully opaque.
    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = if opacity.is_nan() { 1.0 } else { opacity.clamp(0.0, 1.0) };
        self.invalidate();
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        self.invalidate();
    }

    pub fn set_selected(&mut self, selected: bool) {
        self.selected = selected;
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(w: usize, h: usize) -> ImageBuffer {
        let mut px = Vec::with_capacity(w * h * 4);
        for y in 0..h {
            for x in 0..w {
                px.extend_from_slice(&[(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x * y) % 256) as u8, 255]);
            }
        }
        ImageBuffer::from_rgba8(px, w, h).unwrap()
    }

    #[test]
    fn test_mutator_invalidates_until_read() {
        let mut f = Fragment::new(textured(10, 6), "a.png");
        f.get_bounding_box();
        assert!(f.is_cache_valid());

        f.translate_by(3.0, 4.0);
        assert!(!f.is_cache_valid());
        assert_eq!(f.get_bounding_box(), Some(BoundingBox::new(3.0, 4.0, 10.0, 6.0)));
        assert!(f.is_cache_valid());

        f.set_rotation(90.0);
        assert!(!f.is_cache_valid());
        assert_eq!(f.get_transformed_image().unwrap().resolution(), (6, 10));
        assert!(f.is_cache_valid());

        f.set_opacity(0.5);
        assert!(!f.is_cache_valid());
    }

    #[test]
    fn test_rotation_normalized() {
        let mut f = Fragment::new(textured(4, 4), "a");
        f.set_rotation(-450.0);
        assert_eq!(f.rotation(), 270.0);
        f.rotate_by(100.0);
        assert_eq!(f.rotation(), 10.0);
    }

    #[test]
    fn test_reset_bbox_is_raw_rect() {
        let mut f = Fragment::new(textured(30, 20), "a");
        f.set_transform(RigidTransform::new(37.0, 5.0, -8.0, true));
        f.reset_transform();
        assert_eq!(f.get_bounding_box(), Some(BoundingBox::new(0.0, 0.0, 30.0, 20.0)));
    }

    #[test]
    fn test_flip_involutive() {
        let mut f = Fragment::new(textured(9, 5), "a");
        f.set_rotation(30.0);
        let before = f.get_transformed_image().unwrap();
        f.set_flip_horizontal(!f.flip_horizontal());
        assert_ne!(f.get_transformed_image().unwrap(), before);
        f.set_flip_horizontal(!f.flip_horizontal());
        assert!(!f.flip_horizontal());
        assert_eq!(f.get_transformed_image().unwrap(), before);
    }

    #[test]
    fn test_four_quarter_turns_restore_square() {
        let mut f = Fragment::new(textured(8, 8), "a");
        let before = f.get_transformed_image().unwrap();
        for _ in 0..4 {
            f.rotate_by(90.0);
        }
        assert_eq!(f.rotation(), 0.0);
        assert_eq!(f.get_transformed_image().unwrap(), before);

        // Intermediate quarter turns produce exact pixel permutations too
        f.rotate_by(90.0);
        let quarter = f.get_transformed_image().unwrap();
        assert_eq!(quarter.rgba_at(7, 0), before.rgba_at(0, 0));
    }

    #[test]
    fn test_contains_point_inverts_rotation_and_flip() {
        let mut f = Fragment::new(textured(40, 10), "a");
        f.set_position(100.0, 100.0);
        assert!(f.contains_point(101.0, 101.0));
        assert!(!f.contains_point(99.0, 101.0));
        assert!(!f.contains_point(139.0, 111.0));

        // Quarter turn: 10 wide, 40 tall box
        f.set_rotation(90.0);
        assert!(f.contains_point(105.0, 135.0));
        assert!(!f.contains_point(125.0, 105.0));

        // 45deg: box corner is empty, center is inside
        f.set_rotation(45.0);
        f.set_flip_horizontal(true);
        let bb = f.get_bounding_box().unwrap();
        assert!(!f.contains_point(bb.x + 0.5, bb.y + 0.5));
        assert!(f.contains_point(bb.x + bb.width / 2.0, bb.y + bb.height / 2.0));
    }

    #[test]
    fn test_no_content_is_noop() {
        let mut f = Fragment::new(ImageBuffer::empty(), "missing.tif");
        assert!(!f.has_image());
        assert!(f.get_transformed_image().is_none());
        assert!(f.get_bounding_box().is_none());
        assert!(!f.contains_point(0.0, 0.0));
        assert!(!f.rotate_by(90.0));
        assert_eq!(f.rotation(), 0.0);
        assert!(f.snapshot().is_none());
        f.set_visible(false);
        assert!(!f.is_visible());
    }

    #[test]
    fn test_opacity_clamped() {
        let mut f = Fragment::new(textured(2, 2), "a");
        f.set_opacity(1.7);
        assert_eq!(f.opacity(), 1.0);
        f.set_opacity(-0.2);
        assert_eq!(f.opacity(), 0.0);
    }
}
