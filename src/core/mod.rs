//! Core engine modules - events and background workers
//!
//! Independent of the fragment model; used by the manager and render layer.

pub mod event_bus;
pub mod workers;

pub use event_bus::{Event, EventBus};
pub use workers::{PoolStats, Workers};
