//! Dirty-set tracking and render coalescing.
//!
//! Mutators mark fragment ids dirty synchronously; the render loop drains the
//! set at most once per throttle window. Ids are never dropped: a drained id
//! that could not be rendered is re-marked by the renderer.

use indexmap::IndexSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::entities::FragmentId;

/// Shared set of fragment ids whose rasters need regenerating.
///
/// Cloning shares the underlying set (manager and renderer hold handles).
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    ids: Arc<Mutex<IndexSet<FragmentId>>>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, id: FragmentId) {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
    }

    pub fn mark_all<I: IntoIterator<Item = FragmentId>>(&self, ids: I) {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).extend(ids);
    }

    /// Drop a single id (removed fragment).
    pub fn clear(&self, id: FragmentId) {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).shift_remove(&id);
    }

    pub fn is_dirty(&self, id: FragmentId) -> bool {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every dirty id in marking order, leaving the set empty.
    pub fn drain(&self) -> Vec<FragmentId> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.drain(..).collect()
    }
}

/// Coalesces render requests into one pass per window.
///
/// Unlike a debounce, a pending deadline is not pushed back by further
/// requests, so continuous dragging still renders at the window rate.
/// `request_fast()` pulls the deadline in to the interactive interval.
#[derive(Debug, Clone)]
pub struct RenderThrottle {
    window: Duration,
    fast: Duration,
    pending: Option<Instant>,
}

impl Default for RenderThrottle {
    fn default() -> Self {
        Self::new(50, 16)
    }
}

impl RenderThrottle {
    pub fn new(window_ms: u64, fast_ms: u64) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            fast: Duration::from_millis(fast_ms),
            pending: None,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Schedule a pass at the normal window (no-op if already pending).
    pub fn request(&mut self) {
        if self.pending.is_none() {
            self.pending = Some(Instant::now() + self.window);
            log::trace!("RenderThrottle: pass scheduled in {}ms", self.window.as_millis());
        }
    }

    /// Schedule a pass at the interactive interval.
    pub fn request_fast(&mut self) {
        let at = Instant::now() + self.fast;
        self.pending = Some(match self.pending {
            Some(existing) if existing <= at => existing,
            _ => at,
        });
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// True once the deadline passed; clears the pending state.
    pub fn tick(&mut self) -> bool {
        match self.pending {
            Some(at) if Instant::now() >= at => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}
