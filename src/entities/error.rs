//! Error type shared by fragment, manager, loader and metadata code.

use super::fragment::FragmentId;

/// Fragment-level errors.
///
/// Stitching does not use this type: degenerate input and numeric divergence
/// are reported through `StitchStatus` and `StitchResult::reverted` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentError {
    /// Unknown fragment id
    NotFound(FragmentId),
    /// Missing, empty or malformed image content
    InvalidImage(String),
    /// File read/write failure
    Io(String),
    /// Metadata (de)serialization failure
    Serialize(String),
}

impl std::fmt::Display for FragmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FragmentError::NotFound(id) => write!(f, "Fragment not found: {}", id),
            FragmentError::InvalidImage(e) => write!(f, "Invalid image: {}", e),
            FragmentError::Io(e) => write!(f, "I/O error: {}", e),
            FragmentError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for FragmentError {}

impl From<std::io::Error> for FragmentError {
    fn from(e: std::io::Error) -> Self {
        FragmentError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for FragmentError {
    fn from(e: serde_json::Error) -> Self {
        FragmentError::Serialize(e.to_string())
    }
}

impl From<image::ImageError> for FragmentError {
    fn from(e: image::ImageError) -> Self {
        match e {
            image::ImageError::IoError(io) => FragmentError::Io(io.to_string()),
            other => FragmentError::InvalidImage(other.to_string()),
        }
    }
}
