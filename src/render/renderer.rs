//! Background fragment renderer.
//!
//! **Why**: warping and downscaling a slide takes tens of milliseconds; the
//! owner thread only snapshots dirty fragments and hands them to the worker
//! pool. Finished rasters come back over a single-consumer channel and are
//! accepted in `collect()` only if they still match the live fragment.
//!
//! **Used by**: the canvas (or any owner loop) once per throttle tick:
//! `render_dirty()` -> workers -> `collect()` -> `raster()` for drawing.
//! Only fragments intersecting the visible world rect are rendered; off-screen
//! ids stay dirty until panned into view.

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use crate::core::workers::{PoolStats, Workers};
use crate::entities::{
    FragmentId, FragmentManager, FragmentSnapshot, ImageBuffer, RasterKey, warp_image,
};

use super::dirty::{DirtyTracker, RenderThrottle};
use super::lod::{LodPolicy, ZoomBucket};
use super::lod_cache::LodCache;
use super::viewport::ViewportState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Coalescing window for render passes
    pub window_ms: u64,
    /// Interval while dragging/panning
    pub fast_ms: u64,
    pub lod_cache_capacity: usize,
    /// Worker threads, 0 = 3/4 of the cores
    pub workers: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            window_ms: 50,
            fast_ms: 16,
            lod_cache_capacity: 512,
            workers: 0,
        }
    }
}

impl RenderConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            (num_cpus::get() * 3 / 4).max(1)
        }
    }
}

/// Immutable input of one worker render.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub snapshot: FragmentSnapshot,
    pub bucket: ZoomBucket,
    pub scale: f32,
}

impl RenderJob {
    pub fn key(&self) -> RasterKey {
        self.snapshot.transform.raster_key()
    }

    /// Warp then downscale (runs on a worker thread).
    pub fn run(self) -> RenderResult {
        let key = self.key();
        let image = warp_image(&self.snapshot.image, &self.snapshot.transform).downscale(self.scale);
        RenderResult {
            id: self.snapshot.id,
            bucket: self.bucket,
            key,
            image,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderResult {
    pub id: FragmentId,
    pub bucket: ZoomBucket,
    pub key: RasterKey,
    pub image: ImageBuffer,
}

pub struct FragmentRenderer {
    workers: Workers,
    lod: LodPolicy,
    cache: LodCache,
    dirty: DirtyTracker,
    throttle: RenderThrottle,
    tx: Sender<RenderResult>,
    rx: Receiver<RenderResult>,
    /// Submitted, not yet collected
    in_flight: HashMap<(FragmentId, ZoomBucket), RasterKey>,
}

impl FragmentRenderer {
    /// Create a renderer draining `dirty` (usually `manager.dirty_tracker()`).
    pub fn new(config: &RenderConfig, lod: LodPolicy, dirty: DirtyTracker) -> Self {
        let (tx, rx) = unbounded();
        Self {
            workers: Workers::new(config.worker_count(), Arc::new(AtomicU64::new(0))),
            lod,
            cache: LodCache::new(config.lod_cache_capacity),
            dirty,
            throttle: RenderThrottle::new(config.window_ms, config.fast_ms),
            tx,
            rx,
            in_flight: HashMap::new(),
        }
    }

    pub fn lod(&self) -> &LodPolicy {
        &self.lod
    }

    pub fn cache(&self) -> &LodCache {
        &self.cache
    }

    pub fn pending_jobs(&self) -> usize {
        self.in_flight.len()
    }

    /// Request a render pass (`fast` while the user is interacting).
    pub fn schedule(&mut self, fast: bool) {
        if fast {
            self.throttle.request_fast();
        } else {
            self.throttle.request();
        }
    }

    /// Zoom moved: re-render every visible fragment if the bucket changed.
    pub fn zoom_changed(&mut self, manager: &FragmentManager, old_zoom: f64, new_zoom: f64) -> bool {
        if self.lod.bucket_for(old_zoom) == self.lod.bucket_for(new_zoom) {
            return false;
        }
        self.dirty.mark_all(
            manager
                .get_all_fragments()
                .into_iter()
                .filter(|f| f.is_visible())
                .map(|f| f.id()),
        );
        self.throttle.request();
        true
    }

    /// Throttled entry point: collect finished work, then render if the window elapsed.
    pub fn tick(&mut self, manager: &FragmentManager, view: &ViewportState) -> Vec<FragmentId> {
        let updated = self.collect(manager);
        if self.throttle.tick() {
            self.render_dirty(manager, view);
        }
        updated
    }

    /// Drain the dirty set and submit jobs for on-screen fragments. Returns
    /// the number submitted.
    ///
    /// Removed or hidden fragments get their LOD entries evicted; off-screen
    /// fragments are put back into the dirty set; fragments whose raster for
    /// this bucket is still current (translation-only change) are skipped.
    pub fn render_dirty(&mut self, manager: &FragmentManager, view: &ViewportState) -> usize {
        let bucket = self.lod.bucket_for(view.zoom());
        let scale = self.lod.scale_for_bucket(bucket);
        let visible = view.visible_world_rect();
        let epoch = self.workers.current_epoch();
        let mut submitted = 0;
        let mut off_screen = Vec::new();

        for id in self.dirty.drain() {
            let snapshot = match manager.get_fragment(id) {
                Ok(f) if f.is_visible() => f.snapshot(),
                _ => None,
            };
            let Some(snapshot) = snapshot else {
                let evicted = self.cache.evict_fragment(id);
                trace!("Renderer: {} removed/hidden, evicted {} entries", id, evicted);
                continue;
            };

            if !snapshot.bounding_box().intersects(&visible) {
                off_screen.push(id);
                continue;
            }

            let key = snapshot.transform.raster_key();
            self.cache.evict_stale(id, key);
            if self.cache.contains(id, bucket, key) {
                continue;
            }
            if self.in_flight.get(&(id, bucket)) == Some(&key) {
                continue;
            }

            let job = RenderJob {
                snapshot,
                bucket,
                scale,
            };
            let tx = self.tx.clone();
            self.in_flight.insert((id, bucket), key);
            self.workers.execute_with_epoch(epoch, move || {
                tx.send(job.run()).ok();
            });
            submitted += 1;
        }

        if !off_screen.is_empty() {
            trace!("Renderer: {} off-screen fragment(s) left dirty", off_screen.len());
            self.dirty.mark_all(off_screen);
        }
        if submitted > 0 {
            debug!("Renderer: submitted {} jobs @ {} (scale {})", submitted, bucket, scale);
        }
        submitted
    }

    /// Accept one finished result; stale ones are dropped and re-marked dirty.
    fn accept(&mut self, manager: &FragmentManager, result: RenderResult) -> Option<FragmentId> {
        if self.in_flight.get(&(result.id, result.bucket)) == Some(&result.key) {
            self.in_flight.remove(&(result.id, result.bucket));
        }
        let current = match manager.get_fragment(result.id) {
            Ok(f) if f.is_visible() => f.snapshot().map(|s| s.transform.raster_key()),
            _ => None,
        };
        match current {
            Some(key) if key == result.key => {
                self.cache.insert(result.id, result.bucket, result.key, result.image);
                Some(result.id)
            }
            Some(_) => {
                trace!("Renderer: stale result for {}, re-queued", result.id);
                self.dirty.mark(result.id);
                None
            }
            None => None,
        }
    }

    /// Move finished rasters into the LOD cache. Returns ids updated.
    pub fn collect(&mut self, manager: &FragmentManager) -> Vec<FragmentId> {
        let results: Vec<RenderResult> = self.rx.try_iter().collect();
        results
            .into_iter()
            .filter_map(|r| self.accept(manager, r))
            .collect()
    }

    /// Block until every submitted job is collected or `timeout` passes.
    pub fn wait_idle(&mut self, manager: &FragmentManager, timeout: Duration) -> Vec<FragmentId> {
        let deadline = Instant::now() + timeout;
        let mut updated = Vec::new();
        while !self.in_flight.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(result) => updated.extend(self.accept(manager, result)),
                Err(_) => break,
            }
        }
        updated
    }

    /// Display raster for a fragment at `zoom`, if rendered and current.
    pub fn raster(&mut self, manager: &FragmentManager, id: FragmentId, zoom: f64) -> Option<ImageBuffer> {
        let key = manager.get_fragment(id).ok()?.snapshot()?.transform.raster_key();
        self.cache.get(id, self.lod.bucket_for(zoom), key)
    }

    /// Worker pool counters (queued, executed, skipped as stale).
    pub fn pool_stats(&self) -> &PoolStats {
        self.workers.stats()
    }

    /// Drop queued jobs and cached rasters.
    pub fn reset(&mut self) {
        let epoch = self.workers.bump_epoch();
        debug!(
            "Renderer: reset to epoch {}, {} job(s) still queued",
            epoch,
            self.workers.stats().pending()
        );
        self.in_flight.clear();
        self.cache.clear();
        // Results already in the channel are discarded
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn view(zoom: f64) -> ViewportState {
        let mut view = ViewportState::default();
        view.set_zoom(zoom);
        view
    }

    fn setup() -> (FragmentManager, FragmentRenderer) {
        let manager = FragmentManager::new();
        let config = RenderConfig {
            workers: 2,
            ..RenderConfig::default()
        };
        let renderer = FragmentRenderer::new(&config, LodPolicy::default(), manager.dirty_tracker());
        (manager, renderer)
    }

    #[test]
    fn test_render_and_lod_scale() {
        let (mut m, mut r) = setup();
        let id = m.add_fragment_from_image(ImageBuffer::filled(40, 20, [9, 9, 9, 255]), "a");

        assert_eq!(r.render_dirty(&m, &view(0.05)), 1);
        assert_eq!(r.wait_idle(&m, WAIT), vec![id]);
        let raster = r.raster(&m, id, 0.05).unwrap();
        assert_eq!(raster.resolution(), (10, 5));
        // Other bucket not rendered yet
        assert!(r.raster(&m, id, 1.0).is_none());
    }

    #[test]
    fn test_translation_reuses_lod_raster() {
        let (mut m, mut r) = setup();
        let id = m.add_fragment_from_image(ImageBuffer::filled(8, 8, [1, 2, 3, 255]), "a");
        r.render_dirty(&m, &view(1.0));
        r.wait_idle(&m, WAIT);

        m.translate_fragment(id, 50.0, 0.0).unwrap();
        assert_eq!(r.render_dirty(&m, &view(1.0)), 0);
        assert!(r.raster(&m, id, 1.0).is_some());
    }

    #[test]
    fn test_stale_result_discarded_and_requeued() {
        let (mut m, mut r) = setup();
        let id = m.add_fragment_from_image(ImageBuffer::filled(8, 4, [1, 2, 3, 255]), "a");
        r.render_dirty(&m, &view(1.0));

        // Rotation lands after submission: the result no longer matches
        m.rotate_fragment(id, 90.0).unwrap();
        let tracker = m.dirty_tracker();
        tracker.drain();
        assert!(r.wait_idle(&m, WAIT).is_empty());
        assert!(tracker.is_dirty(id));
        assert!(r.raster(&m, id, 1.0).is_none());

        // Next pass renders the rotated raster
        assert_eq!(r.render_dirty(&m, &view(1.0)), 1);
        r.wait_idle(&m, WAIT);
        assert_eq!(r.raster(&m, id, 1.0).unwrap().resolution(), (4, 8));
    }

    #[test]
    fn test_removed_and_hidden_evicted() {
        let (mut m, mut r) = setup();
        let a = m.add_fragment_from_image(ImageBuffer::filled(4, 4, [0, 0, 0, 255]), "a");
        let b = m.add_fragment_from_image(ImageBuffer::filled(4, 4, [0, 0, 0, 255]), "b");
        r.render_dirty(&m, &view(1.0));
        r.wait_idle(&m, WAIT);
        assert_eq!(r.cache().len(), 2);

        m.remove_fragment(a).unwrap();
        m.set_fragment_visibility(b, false).unwrap();
        assert_eq!(r.render_dirty(&m, &view(1.0)), 0);
        assert!(r.cache().is_empty());
    }

    #[test]
    fn test_zoom_bucket_change_marks_visible() {
        let (mut m, mut r) = setup();
        let a = m.add_fragment_from_image(ImageBuffer::filled(4, 4, [0, 0, 0, 255]), "a");
        let tracker = m.dirty_tracker();
        tracker.drain();
        assert!(!r.zoom_changed(&m, 0.6, 0.9));
        assert!(r.zoom_changed(&m, 0.9, 0.2));
        assert!(tracker.is_dirty(a));
    }

    #[test]
    fn test_off_screen_stays_dirty_until_visible() {
        let (mut m, mut r) = setup();
        let near = m.add_fragment_from_image(ImageBuffer::filled(8, 8, [1, 2, 3, 255]), "near");
        let far = m.add_fragment_from_image(ImageBuffer::filled(8, 8, [1, 2, 3, 255]), "far");
        m.set_fragment_position(far, 1e6, 1e6).unwrap();
        let tracker = m.dirty_tracker();

        let mut vp = view(1.0);
        assert_eq!(r.render_dirty(&m, &vp), 1);
        assert!(tracker.is_dirty(far));
        assert!(!tracker.is_dirty(near));
        r.wait_idle(&m, WAIT);
        assert!(r.raster(&m, far, 1.0).is_none());

        // Pan the far fragment into view
        vp.set_pan(-1e6, -1e6);
        assert_eq!(r.render_dirty(&m, &vp), 1);
        assert!(tracker.is_empty());
        r.wait_idle(&m, WAIT);
        assert!(r.raster(&m, far, 1.0).is_some());
    }

    #[test]
    fn test_reset_skips_queued_renders() {
        let (mut m, mut r) = setup();
        for i in 0..6 {
            m.add_fragment_from_image(ImageBuffer::filled(64, 64, [5, 5, 5, 255]), format!("f{}", i));
        }
        assert_eq!(r.render_dirty(&m, &view(1.0)), 6);
        r.reset();
        let deadline = Instant::now() + WAIT;
        while r.pool_stats().pending() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let stats = r.pool_stats();
        assert_eq!(stats.pending(), 0);
        assert_eq!(stats.executed() + stats.skipped_stale(), 6);
        assert!(r.cache().is_empty());
    }
}
