//! Tessera - rigid stitching of scanned tissue fragments
//!
//! Re-exports all modules for use by the binary target.

// Engine plumbing (events, workers)
pub mod core;

// Fragment model, I/O and compositing
pub mod entities;

// Display rasters: viewport, LOD, background rendering
pub mod render;

// Overlap-driven alignment
pub mod stitch;

pub mod cli;
pub mod config;

pub use core::event_bus::{Event, EventBus};
pub use core::workers::Workers;

pub use entities::{
    BoundingBox, Fragment, FragmentError, FragmentId, FragmentManager, FragmentsChanged, ImageBuffer,
    Metadata, RigidTransform,
};
pub use stitch::{RigidStitcher, StitchBudget, StitchConfig, StitchResult, StitchStatus};
