//! Render layer - viewport, level of detail and background rasterization
//!
//! Nothing here draws pixels on screen; it produces display rasters for a
//! canvas backend and keeps them consistent with the fragment model.

pub mod dirty;
pub mod lod;
pub mod lod_cache;
pub mod renderer;
pub mod viewport;

pub use dirty::{DirtyTracker, RenderThrottle};
pub use lod::{LodPolicy, ZoomBucket};
pub use lod_cache::{CacheStats, LodCache};
pub use renderer::{FragmentRenderer, RenderConfig, RenderJob, RenderResult};
pub use viewport::{ViewportConfig, ViewportState};
