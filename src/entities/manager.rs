//! FragmentManager - ordered fragment collection and the only mutation path.
//!
//! Insertion order is z-order (last = topmost). Every mutator:
//! 1. validates the id (`FragmentError::NotFound`)
//! 2. applies the change, invalidating the fragment's transform cache
//! 3. marks the touched ids in the shared [`DirtyTracker`]
//! 4. emits exactly one [`FragmentsChanged`] on the owned [`EventBus`]
//!
//! Transform mutators on a fragment without image content fail with
//! `FragmentError::InvalidImage` and emit nothing.

use indexmap::IndexMap;
use log::{debug, info};

use super::error::FragmentError;
use super::fragment::{Fragment, FragmentId, FragmentSnapshot};
use super::image::ImageBuffer;
use super::metadata::{FragmentRecord, Metadata};
use super::transform::{BoundingBox, RigidTransform};
use crate::core::event_bus::EventBus;
use crate::render::DirtyTracker;

/// Emitted once per successful manager mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentsChanged;

#[derive(Debug, Default)]
pub struct FragmentManager {
    fragments: IndexMap<FragmentId, Fragment>,
    selected: Option<FragmentId>,
    events: EventBus,
    dirty: DirtyTracker,
}

impl FragmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self) {
        self.events.emit(FragmentsChanged);
    }

    fn changed(&self, id: FragmentId) {
        self.dirty.mark(id);
        self.notify();
    }

    fn fragment_mut(&mut self, id: FragmentId) -> Result<&mut Fragment, FragmentError> {
        self.fragments.get_mut(&id).ok_or(FragmentError::NotFound(id))
    }

    /// Run a transform mutator; maps "no content" to `InvalidImage`.
    fn mutate_transform<F>(&mut self, id: FragmentId, f: F) -> Result<(), FragmentError>
    where
        F: FnOnce(&mut Fragment) -> bool,
    {
        let fragment = self.fragment_mut(id)?;
        if !f(fragment) {
            return Err(FragmentError::InvalidImage(format!(
                "fragment {} has no image content",
                id
            )));
        }
        self.changed(id);
        Ok(())
    }

    // === Collection ===

    /// Add a fragment on top of the stack.
    pub fn add_fragment_from_image(
        &mut self,
        image: ImageBuffer,
        label: impl Into<String>,
    ) -> FragmentId {
        let fragment = Fragment::new(image, label);
        let id = fragment.id();
        debug!(
            "FragmentManager: added {} '{}' ({}x{})",
            id,
            fragment.label(),
            fragment.raw_size().0,
            fragment.raw_size().1
        );
        self.fragments.insert(id, fragment);
        self.changed(id);
        id
    }

    /// Remove and return a fragment; clears the selection if it pointed here.
    pub fn remove_fragment(&mut self, id: FragmentId) -> Result<Fragment, FragmentError> {
        let fragment = self
            .fragments
            .shift_remove(&id)
            .ok_or(FragmentError::NotFound(id))?;
        if self.selected == Some(id) {
            self.selected = None;
        }
        debug!("FragmentManager: removed {}", id);
        // Dirty so the renderer evicts its rasters
        self.changed(id);
        Ok(fragment)
    }

    pub fn get_fragment(&self, id: FragmentId) -> Result<&Fragment, FragmentError> {
        self.fragments.get(&id).ok_or(FragmentError::NotFound(id))
    }

    /// All fragments in insertion (z) order.
    pub fn get_all_fragments(&self) -> Vec<&Fragment> {
        self.fragments.values().collect()
    }

    pub fn ids(&self) -> Vec<FragmentId> {
        self.fragments.keys().copied().collect()
    }

    pub fn contains(&self, id: FragmentId) -> bool {
        self.fragments.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    // === Selection ===

    pub fn set_selected_fragment(&mut self, id: Option<FragmentId>) -> Result<(), FragmentError> {
        if let Some(id) = id {
            if !self.fragments.contains_key(&id) {
                return Err(FragmentError::NotFound(id));
            }
        }
        if let Some(prev) = self.selected.take() {
            if let Some(f) = self.fragments.get_mut(&prev) {
                f.set_selected(false);
                self.dirty.mark(prev);
            }
        }
        if let Some(id) = id {
            if let Some(f) = self.fragments.get_mut(&id) {
                f.set_selected(true);
                self.dirty.mark(id);
            }
        }
        self.selected = id;
        self.notify();
        Ok(())
    }

    pub fn get_selected_fragment(&self) -> Option<&Fragment> {
        self.selected.and_then(|id| self.fragments.get(&id))
    }

    pub fn get_selected_fragment_id(&self) -> Option<FragmentId> {
        self.selected
    }

    // === Display ===

    pub fn set_fragment_visibility(&mut self, id: FragmentId, visible: bool) -> Result<(), FragmentError> {
        self.fragment_mut(id)?.set_visible(visible);
        self.changed(id);
        Ok(())
    }

    pub fn set_fragment_opacity(&mut self, id: FragmentId, opacity: f32) -> Result<(), FragmentError> {
        self.fragment_mut(id)?.set_opacity(opacity);
        self.changed(id);
        Ok(())
    }

    // === Transforms ===

    pub fn rotate_fragment(&mut self, id: FragmentId, delta: f64) -> Result<(), FragmentError> {
        self.mutate_transform(id, |f| f.rotate_by(delta))
    }

    pub fn set_fragment_rotation(&mut self, id: FragmentId, angle: f64) -> Result<(), FragmentError> {
        self.mutate_transform(id, |f| f.set_rotation(angle))
    }

    /// Toggle the mirror flag of one axis (`horizontal == false` flips vertically).
    pub fn flip_fragment(&mut self, id: FragmentId, horizontal: bool) -> Result<(), FragmentError> {
        self.mutate_transform(id, |f| {
            if horizontal {
                f.set_flip_horizontal(!f.flip_horizontal())
            } else {
                f.set_flip_vertical(!f.flip_vertical())
            }
        })
    }

    pub fn translate_fragment(&mut self, id: FragmentId, dx: f64, dy: f64) -> Result<(), FragmentError> {
        self.mutate_transform(id, |f| f.translate_by(dx, dy))
    }

    pub fn set_fragment_position(&mut self, id: FragmentId, x: f64, y: f64) -> Result<(), FragmentError> {
        self.mutate_transform(id, |f| f.set_position(x, y))
    }

    /// Set rotation, translation and horizontal flip at once (vertical flip kept).
    pub fn set_fragment_transform(
        &mut self,
        id: FragmentId,
        rotation: f64,
        translation: (f64, f64),
        flip_horizontal: bool,
    ) -> Result<(), FragmentError> {
        self.mutate_transform(id, |f| {
            let t = RigidTransform {
                rotation,
                x: translation.0,
                y: translation.1,
                flip_horizontal,
                flip_vertical: f.flip_vertical(),
            };
            f.set_transform(t)
        })
    }

    /// Apply a batch of transforms with a single notification.
    ///
    /// All ids are validated before anything changes. Fragments without
    /// content are skipped. Returns the number of fragments updated.
    pub fn apply_transforms(
        &mut self,
        transforms: &IndexMap<FragmentId, RigidTransform>,
    ) -> Result<usize, FragmentError> {
        if let Some(missing) = transforms.keys().find(|id| !self.fragments.contains_key(*id)) {
            return Err(FragmentError::NotFound(*missing));
        }
        let mut applied = 0;
        for (id, t) in transforms {
            if let Some(f) = self.fragments.get_mut(id) {
                if f.set_transform(*t) {
                    self.dirty.mark(*id);
                    applied += 1;
                } else {
                    debug!("FragmentManager: skipped transform for {} (no content)", id);
                }
            }
        }
        self.notify();
        Ok(applied)
    }

    pub fn reset_fragment_transform(&mut self, id: FragmentId) -> Result<(), FragmentError> {
        self.mutate_transform(id, |f| f.reset_transform())
    }

    pub fn reset_all_transforms(&mut self) {
        for (id, f) in self.fragments.iter_mut() {
            if f.reset_transform() {
                self.dirty.mark(*id);
            }
        }
        self.notify();
    }

    // === Queries ===

    /// Topmost visible fragment under a world point.
    pub fn fragment_at(&self, x: f64, y: f64) -> Option<FragmentId> {
        self.fragments
            .values()
            .rev()
            .find(|f| f.is_visible() && f.contains_point(x, y))
            .map(|f| f.id())
    }

    /// Union of the bounding boxes of visible fragments with content.
    pub fn content_bounds(&self) -> Option<BoundingBox> {
        self.fragments
            .values()
            .filter(|f| f.is_visible())
            .filter_map(|f| f.get_bounding_box())
            .reduce(|a, b| a.union(&b))
    }

    /// Consistent copy of every fragment with content, in z-order.
    pub fn snapshot(&self) -> Vec<FragmentSnapshot> {
        self.fragments.values().filter_map(|f| f.snapshot()).collect()
    }

    // === Metadata ===

    pub fn export_metadata(&self) -> Metadata {
        Metadata {
            fragments: self.fragments.values().map(FragmentRecord::from_fragment).collect(),
        }
    }

    /// Re-apply exported records (transform, opacity, visibility).
    ///
    /// Records match by id, or failing that by label against fragments not
    /// matched yet. Unmatched records are ignored. Returns the number applied.
    pub fn apply_metadata(&mut self, metadata: &Metadata) -> usize {
        let mut matched: Vec<FragmentId> = Vec::with_capacity(metadata.len());
        for rec in metadata.iter() {
            let target = if self.fragments.contains_key(&rec.id) && !matched.contains(&rec.id) {
                Some(rec.id)
            } else {
                self.fragments
                    .values()
                    .find(|f| f.label() == rec.label && !matched.contains(&f.id()))
                    .map(|f| f.id())
            };
            let Some(id) = target else {
                debug!("FragmentManager: no fragment for record '{}' ({})", rec.label, rec.id);
                continue;
            };
            if let Some(f) = self.fragments.get_mut(&id) {
                f.set_transform(rec.transform());
                f.set_opacity(rec.opacity);
                f.set_visible(rec.visible);
                self.dirty.mark(id);
                matched.push(id);
            }
        }
        info!("FragmentManager: applied {}/{} metadata records", matched.len(), metadata.len());
        self.notify();
        matched.len()
    }

    // === Observation ===

    /// Register a change observer (called synchronously on the mutating thread).
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&FragmentsChanged) + Send + Sync + 'static,
    {
        self.events.subscribe::<FragmentsChanged, _>(callback);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn dirty_tracker(&self) -> DirtyTracker {
        self.dirty.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn image(w: usize, h: usize) -> ImageBuffer {
        let mut px = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                px.extend_from_slice(&[(x * 11 % 256) as u8, (y * 5 % 256) as u8, 90]);
            }
        }
        ImageBuffer::from_rgb8(px, w, h).unwrap()
    }

    fn counted(m: &FragmentManager) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        m.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_one_notification_per_mutator() {
        let mut m = FragmentManager::new();
        let count = counted(&m);
        let a = m.add_fragment_from_image(image(10, 10), "a");
        let b = m.add_fragment_from_image(image(10, 10), "b");
        assert_eq!(count.load(Ordering::SeqCst), 2);

        m.rotate_fragment(a, 90.0).unwrap();
        m.translate_fragment(a, 1.0, 2.0).unwrap();
        m.flip_fragment(b, true).unwrap();
        m.set_fragment_visibility(b, false).unwrap();
        m.set_selected_fragment(Some(a)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 7);

        // Batch operations notify once
        m.reset_all_transforms();
        assert_eq!(count.load(Ordering::SeqCst), 8);
        let mut batch = IndexMap::new();
        batch.insert(a, RigidTransform::new(10.0, 0.0, 0.0, false));
        batch.insert(b, RigidTransform::new(20.0, 5.0, 0.0, true));
        assert_eq!(m.apply_transforms(&batch).unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_long_session_notifies_without_backlog() {
        let mut m = FragmentManager::new();
        let count = counted(&m);
        let a = m.add_fragment_from_image(image(10, 10), "a");
        for _ in 0..1500 {
            m.translate_fragment(a, 1.0, 0.0).unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1501);
        assert_eq!(m.get_fragment(a).unwrap().position(), (1500.0, 0.0));
        // Dispatch is synchronous; the bus only knows its subscriber
        assert_eq!(m.events().subscriber_count::<FragmentsChanged>(), 1);
        assert_eq!(m.events().emit(FragmentsChanged), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1502);
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let mut m = FragmentManager::new();
        let count = counted(&m);
        let ghost = FragmentId::new();
        assert_eq!(m.rotate_fragment(ghost, 5.0), Err(FragmentError::NotFound(ghost)));
        assert!(matches!(m.get_fragment(ghost), Err(FragmentError::NotFound(_))));
        assert!(m.remove_fragment(ghost).is_err());
        assert!(m.set_selected_fragment(Some(ghost)).is_err());

        let mut batch = IndexMap::new();
        batch.insert(ghost, RigidTransform::identity());
        assert!(m.apply_transforms(&batch).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_content_transform_rejected() {
        let mut m = FragmentManager::new();
        let id = m.add_fragment_from_image(ImageBuffer::empty(), "broken.tif");
        let count = counted(&m);
        assert!(matches!(m.rotate_fragment(id, 90.0), Err(FragmentError::InvalidImage(_))));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // Display flags still apply
        m.set_fragment_visibility(id, false).unwrap();
        assert!(!m.get_fragment(id).unwrap().is_visible());
        assert!(m.snapshot().is_empty());
    }

    #[test]
    fn test_remove_selected_clears_selection() {
        let mut m = FragmentManager::new();
        let a = m.add_fragment_from_image(image(4, 4), "a");
        let b = m.add_fragment_from_image(image(4, 4), "b");
        m.set_selected_fragment(Some(a)).unwrap();
        assert!(m.get_fragment(a).unwrap().is_selected());

        m.set_selected_fragment(Some(b)).unwrap();
        assert!(!m.get_fragment(a).unwrap().is_selected());

        let removed = m.remove_fragment(b).unwrap();
        assert_eq!(removed.id(), b);
        assert_eq!(m.get_selected_fragment_id(), None);
        assert!(m.get_selected_fragment().is_none());
        assert_eq!(m.ids(), vec![a]);
    }

    #[test]
    fn test_mutators_mark_dirty() {
        let mut m = FragmentManager::new();
        let tracker = m.dirty_tracker();
        let a = m.add_fragment_from_image(image(4, 4), "a");
        tracker.drain();

        m.set_fragment_position(a, 3.0, 3.0).unwrap();
        assert!(tracker.is_dirty(a));
        tracker.drain();
        m.remove_fragment(a).unwrap();
        assert_eq!(tracker.drain(), vec![a]);
    }

    #[test]
    fn test_fragment_at_returns_topmost() {
        let mut m = FragmentManager::new();
        let bottom = m.add_fragment_from_image(image(20, 20), "bottom");
        let top = m.add_fragment_from_image(image(20, 20), "top");
        m.set_fragment_position(top, 10.0, 10.0).unwrap();

        assert_eq!(m.fragment_at(15.0, 15.0), Some(top));
        assert_eq!(m.fragment_at(5.0, 5.0), Some(bottom));
        assert_eq!(m.fragment_at(50.0, 50.0), None);

        m.set_fragment_visibility(top, false).unwrap();
        assert_eq!(m.fragment_at(15.0, 15.0), Some(bottom));
    }

    #[test]
    fn test_content_bounds_union() {
        let mut m = FragmentManager::new();
        assert!(m.content_bounds().is_none());
        m.add_fragment_from_image(image(10, 10), "a");
        let b = m.add_fragment_from_image(image(10, 20), "b");
        m.set_fragment_position(b, 30.0, -5.0).unwrap();
        assert_eq!(m.content_bounds(), Some(BoundingBox::new(0.0, -5.0, 40.0, 20.0)));
    }

    #[test]
    fn test_set_fragment_transform_keeps_vertical_flip() {
        let mut m = FragmentManager::new();
        let a = m.add_fragment_from_image(image(6, 4), "a");
        m.flip_fragment(a, false).unwrap();
        m.set_fragment_transform(a, -90.0, (2.0, 3.0), true).unwrap();
        let t = m.get_fragment(a).unwrap().transform();
        assert_eq!(t.rotation, 270.0);
        assert!(t.flip_horizontal && t.flip_vertical);
        assert_eq!((t.x, t.y), (2.0, 3.0));
    }

    #[test]
    fn test_export_metadata_order_and_roundtrip() {
        let mut m = FragmentManager::new();
        let ids: Vec<_> = (0..4)
            .map(|i| m.add_fragment_from_image(image(12 + i, 8), format!("f{}", i)))
            .collect();
        m.set_fragment_transform(ids[1], 33.0, (10.5, -3.0), true).unwrap();
        m.set_fragment_transform(ids[2], 270.0, (-40.0, 7.0), false).unwrap();
        m.set_fragment_opacity(ids[3], 0.4).unwrap();
        m.flip_fragment(ids[3], false).unwrap();

        let meta = m.export_metadata();
        assert_eq!(meta.len(), 4);
        let rec_ids: Vec<_> = meta.iter().map(|r| r.id).collect();
        assert_eq!(rec_ids, ids);

        let before: Vec<_> = m.get_all_fragments().iter().map(|f| f.get_bounding_box()).collect();
        m.reset_all_transforms();
        let json = meta.to_json_string().unwrap();
        let loaded = Metadata::from_json_str(&json).unwrap();
        assert_eq!(m.apply_metadata(&loaded), 4);
        let after: Vec<_> = m.get_all_fragments().iter().map(|f| f.get_bounding_box()).collect();
        assert_eq!(before, after);
        assert_eq!(m.get_fragment(ids[3]).unwrap().opacity(), 0.4);
    }

    #[test]
    fn test_apply_metadata_matches_by_label() {
        let mut source = FragmentManager::new();
        let a = source.add_fragment_from_image(image(5, 5), "left.tif");
        source.set_fragment_position(a, 100.0, 0.0).unwrap();
        let meta = source.export_metadata();

        // Fresh session: new ids, same labels
        let mut m = FragmentManager::new();
        let other = m.add_fragment_from_image(image(5, 5), "right.tif");
        let left = m.add_fragment_from_image(image(5, 5), "left.tif");
        assert_eq!(m.apply_metadata(&meta), 1);
        assert_eq!(m.get_fragment(left).unwrap().position(), (100.0, 0.0));
        assert_eq!(m.get_fragment(other).unwrap().position(), (0.0, 0.0));
    }
}
