//! Entities - fragment data model, independent of any UI
//!
//! - `image` / `transform`: raster and rigid placement value types
//! - `fragment` + `cache`: one slide with lazily derived data
//! - `manager`: ordered collection, the single mutation path
//! - `metadata`, `loader`, `compositor`: import/export adapters

pub mod cache;
pub mod compositor;
pub mod error;
pub mod fragment;
pub mod image;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod transform;

pub use cache::TransformCache;
pub use compositor::{CpuCompositor, composite};
pub use error::FragmentError;
pub use fragment::{Fragment, FragmentId, FragmentSnapshot};
pub use image::{ImageBuffer, PixelFormat};
pub use loader::{LoadReport, load_image, load_into, save_image};
pub use manager::{FragmentManager, FragmentsChanged};
pub use metadata::{FragmentRecord, Metadata};
pub use transform::{BoundingBox, RasterKey, RigidTransform, normalize_angle, rotated_size, warp_image};
