//! LOD raster cache with LRU eviction
//!
//! Key: (fragment id, zoom bucket) -> downscaled transformed raster.
//! Every entry is tagged with the [`RasterKey`] it was rendered for; a lookup
//! with a different key is a miss, so a rotated or flipped fragment is never
//! drawn with an old raster. Stale entries are dropped by `evict_stale`.

use log::debug;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::entities::{FragmentId, ImageBuffer, RasterKey};

use super::lod::ZoomBucket;

/// Hit/miss counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct LodCache {
    cache: LruCache<(FragmentId, ZoomBucket), (RasterKey, ImageBuffer)>,
    stats: CacheStats,
    /// Bytes held by cached rasters
    mem: usize,
}

impl LodCache {
    /// Create with an entry capacity (0 falls back to 256).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN.saturating_add(255));
        debug!("LodCache created: capacity={}", capacity);
        Self {
            cache: LruCache::new(capacity),
            stats: CacheStats::new(),
            mem: 0,
        }
    }

    /// Raster for `(id, bucket)` if it was rendered for `key`.
    pub fn get(&mut self, id: FragmentId, bucket: ZoomBucket, key: RasterKey) -> Option<ImageBuffer> {
        match self.cache.get(&(id, bucket)) {
            Some((cached_key, image)) if *cached_key == key => {
                self.stats.record_hit();
                Some(image.clone())
            }
            _ => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Check without touching LRU order or stats.
    pub fn contains(&self, id: FragmentId, bucket: ZoomBucket, key: RasterKey) -> bool {
        matches!(self.cache.peek(&(id, bucket)), Some((k, _)) if *k == key)
    }

    pub fn insert(&mut self, id: FragmentId, bucket: ZoomBucket, key: RasterKey, image: ImageBuffer) {
        self.mem += image.mem();
        if let Some((_, (_, old))) = self.cache.push((id, bucket), (key, image)) {
            // Either the replaced value for this key or the evicted LRU entry
            self.mem = self.mem.saturating_sub(old.mem());
        }
        debug!("LodCache: cached {} @ {} ({} entries, {} KB)", id, bucket, self.cache.len(), self.mem / 1024);
    }

    /// Drop every bucket of one fragment (removed or hidden).
    pub fn evict_fragment(&mut self, id: FragmentId) -> usize {
        self.evict_where(|fid, _| fid == id)
    }

    /// Drop entries of `id` rendered for anything other than `current`.
    pub fn evict_stale(&mut self, id: FragmentId, current: RasterKey) -> usize {
        self.evict_where(|fid, key| fid == id && key != current)
    }

    fn evict_where<F: Fn(FragmentId, RasterKey) -> bool>(&mut self, pred: F) -> usize {
        let to_remove: Vec<(FragmentId, ZoomBucket)> = self
            .cache
            .iter()
            .filter(|((fid, _), (key, _))| pred(*fid, *key))
            .map(|(k, _)| *k)
            .collect();
        for k in &to_remove {
            if let Some((_, image)) = self.cache.pop(k) {
                self.mem = self.mem.saturating_sub(image.mem());
            }
        }
        to_remove.len()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.mem = 0;
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn mem(&self) -> usize {
        self.mem
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::RigidTransform;

    fn key(rot: f64) -> RasterKey {
        RigidTransform::new(rot, 0.0, 0.0, false).raster_key()
    }

    #[test]
    fn test_key_mismatch_is_miss() {
        let mut cache = LodCache::new(8);
        let id = FragmentId::new();
        let bucket = ZoomBucket::from_milli(250);
        cache.insert(id, bucket, key(0.0), ImageBuffer::filled(2, 2, [0; 4]));

        assert!(cache.get(id, bucket, key(0.0)).is_some());
        assert!(cache.get(id, bucket, key(90.0)).is_none());
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hit_rate(), 0.5);

        assert_eq!(cache.evict_stale(id, key(90.0)), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.mem(), 0);
    }

    #[test]
    fn test_lru_eviction_and_mem() {
        let mut cache = LodCache::new(2);
        let ids: Vec<_> = (0..3).map(|_| FragmentId::new()).collect();
        let b = ZoomBucket::from_milli(100);
        for id in &ids {
            cache.insert(*id, b, key(0.0), ImageBuffer::filled(2, 2, [1; 4]));
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.mem(), 2 * 16);
        assert!(!cache.contains(ids[0], b, key(0.0)));
        assert!(cache.contains(ids[2], b, key(0.0)));
    }

    #[test]
    fn test_evict_fragment_all_buckets() {
        let mut cache = LodCache::new(8);
        let (a, other) = (FragmentId::new(), FragmentId::new());
        for milli in [100, 250, 500] {
            cache.insert(a, ZoomBucket::from_milli(milli), key(0.0), ImageBuffer::filled(1, 1, [0; 4]));
        }
        cache.insert(other, ZoomBucket::from_milli(100), key(0.0), ImageBuffer::filled(1, 1, [0; 4]));
        assert_eq!(cache.evict_fragment(a), 3);
        assert_eq!(cache.len(), 1);
    }
}
