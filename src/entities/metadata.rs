//! Metadata snapshot: per-fragment transform parameters, no pixel data.
//!
//! Serializes as a pretty-printed JSON array in insertion (z) order.
//! Records are matched back to fragments by id first, then by label, so a
//! snapshot taken in one session can seed placements in the next one (ids
//! are regenerated on every load).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::error::FragmentError;
use super::fragment::{Fragment, FragmentId};
use super::transform::RigidTransform;

fn default_opacity() -> f32 {
    1.0
}

fn default_visible() -> bool {
    true
}

/// One exported fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentRecord {
    pub id: FragmentId,
    pub label: String,
    pub rotation: f64,
    pub translation_x: f64,
    pub translation_y: f64,
    pub flip_horizontal: bool,
    #[serde(default)]
    pub flip_vertical: bool,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

impl FragmentRecord {
    pub fn from_fragment(fragment: &Fragment) -> Self {
        let t = fragment.transform();
        Self {
            id: fragment.id(),
            label: fragment.label().to_string(),
            rotation: t.rotation,
            translation_x: t.x,
            translation_y: t.y,
            flip_horizontal: t.flip_horizontal,
            flip_vertical: t.flip_vertical,
            opacity: fragment.opacity(),
            visible: fragment.is_visible(),
        }
    }

    pub fn transform(&self) -> RigidTransform {
        RigidTransform {
            rotation: self.rotation,
            x: self.translation_x,
            y: self.translation_y,
            flip_horizontal: self.flip_horizontal,
            flip_vertical: self.flip_vertical,
        }
        .normalized()
    }
}

/// Ordered list of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    pub fragments: Vec<FragmentRecord>,
}

impl Metadata {
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FragmentRecord> {
        self.fragments.iter()
    }

    pub fn to_json_string(&self) -> Result<String, FragmentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self, FragmentError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write to `path` (extension forced to `.json`).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<(), FragmentError> {
        let json = self.to_json_string()?;
        let path = path.as_ref();
        let path = if path.extension().and_then(|s| s.to_str()) != Some("json") {
            path.with_extension("json")
        } else {
            path.to_path_buf()
        };
        fs::write(&path, json)?;
        log::debug!("Metadata: wrote {} records to {}", self.len(), path.display());
        Ok(())
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self, FragmentError> {
        let json = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ImageBuffer;

    #[test]
    fn test_record_fields_in_json() {
        let mut f = Fragment::new(ImageBuffer::filled(4, 4, [0, 0, 0, 255]), "slide_a.tif");
        f.set_transform(RigidTransform::new(15.0, 3.0, -2.0, true));
        let meta = Metadata {
            fragments: vec![FragmentRecord::from_fragment(&f)],
        };
        let json = meta.to_json_string().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let rec = &value.as_array().unwrap()[0];
        for key in [
            "id",
            "label",
            "rotation",
            "translation_x",
            "translation_y",
            "flip_horizontal",
            "flip_vertical",
            "opacity",
            "visible",
        ] {
            assert!(rec.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(rec["id"], serde_json::Value::String(f.id().to_string()));
    }

    #[test]
    fn test_file_roundtrip_and_defaults() {
        let f = Fragment::new(ImageBuffer::filled(2, 2, [0, 0, 0, 255]), "b.png");
        let meta = Metadata {
            fragments: vec![FragmentRecord::from_fragment(&f)],
        };
        let path = std::env::temp_dir().join(format!("tessera_meta_{}.json", f.id()));
        meta.to_json(&path).unwrap();
        assert_eq!(Metadata::from_json(&path).unwrap(), meta);
        let _ = fs::remove_file(&path);

        // Older files without flip_vertical/opacity/visible still load
        let json = format!(
            r#"[{{"id":"{}","label":"x","rotation":-90.0,"translation_x":1.0,"translation_y":2.0,"flip_horizontal":false}}]"#,
            f.id()
        );
        let meta = Metadata::from_json_str(&json).unwrap();
        let rec = &meta.fragments[0];
        assert!(rec.visible);
        assert_eq!(rec.opacity, 1.0);
        assert_eq!(rec.transform().rotation, 270.0);
    }

    #[test]
    fn test_parse_error_is_serialize() {
        assert!(matches!(Metadata::from_json_str("{not json"), Err(FragmentError::Serialize(_))));
    }
}
