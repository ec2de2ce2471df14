//! Level-of-detail policy: which raster resolution to show at a given zoom.
//!
//! Below `lod_threshold` the transformed raster is box-downscaled before
//! display. Zoom values are quantized into [`ZoomBucket`]s so small zoom
//! changes reuse the cached LOD raster.

use serde::{Deserialize, Serialize};

/// Quantized zoom, stored in thousandths so it can key a hash map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoomBucket(u32);

impl ZoomBucket {
    pub fn from_milli(milli: u32) -> Self {
        Self(milli)
    }

    pub fn milli(&self) -> u32 {
        self.0
    }

    pub fn zoom(&self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl std::fmt::Display for ZoomBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}x", self.zoom())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodPolicy {
    pub enabled: bool,
    /// Zoom at and above which full resolution is used
    pub lod_threshold: f64,
    /// `(zoom_below, scale)` pairs in ascending zoom; the first match wins,
    /// zooms past the last entry (but under the threshold) use `default_scale`
    pub scales: Vec<(f64, f32)>,
    pub default_scale: f32,
    /// Upper bounds of the fixed zoom buckets, ascending
    pub buckets: Vec<f64>,
    /// Past the last bucket zoom is snapped to this step...
    pub high_zoom_step: f64,
    /// ...and capped here
    pub max_bucket_zoom: f64,
}

impl Default for LodPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            lod_threshold: 0.5,
            scales: vec![(0.1, 0.25), (0.25, 0.5)],
            default_scale: 0.75,
            buckets: vec![0.1, 0.25, 0.5, 1.0, 2.0],
            high_zoom_step: 0.5,
            max_bucket_zoom: 10.0,
        }
    }
}

impl LodPolicy {
    /// Raster scale for `zoom` (1.0 = full resolution).
    pub fn scale_for(&self, zoom: f64) -> f32 {
        if !self.enabled || zoom >= self.lod_threshold {
            return 1.0;
        }
        self.scales
            .iter()
            .find(|(below, _)| zoom < *below)
            .map(|(_, scale)| *scale)
            .unwrap_or(self.default_scale)
    }

    /// Cache bucket for `zoom`.
    pub fn bucket_for(&self, zoom: f64) -> ZoomBucket {
        let z = match self.buckets.iter().find(|upper| zoom < **upper) {
            Some(upper) => *upper,
            None => {
                let capped = zoom.min(self.max_bucket_zoom);
                if self.high_zoom_step > 0.0 {
                    (capped / self.high_zoom_step).floor() * self.high_zoom_step
                } else {
                    capped
                }
            }
        };
        ZoomBucket((z.max(0.0) * 1000.0).round() as u32)
    }

    /// Scale used for rasters cached under `bucket`.
    ///
    /// Each fixed bucket covers zooms strictly below its bound, so the scale
    /// is taken just under it.
    pub fn scale_for_bucket(&self, bucket: ZoomBucket) -> f32 {
        let z = bucket.zoom();
        if self.buckets.iter().any(|b| (b - z).abs() < 1e-9) {
            self.scale_for(z - 1e-6)
        } else {
            self.scale_for(z)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_policy() {
        let lod = LodPolicy::default();
        assert_eq!(lod.scale_for(0.05), 0.25);
        assert_eq!(lod.scale_for(0.1), 0.5);
        assert_eq!(lod.scale_for(0.2), 0.5);
        assert_eq!(lod.scale_for(0.3), 0.75);
        assert_eq!(lod.scale_for(0.5), 1.0);
        assert_eq!(lod.scale_for(4.0), 1.0);

        let off = LodPolicy {
            enabled: false,
            ..LodPolicy::default()
        };
        assert_eq!(off.scale_for(0.05), 1.0);
    }

    #[test]
    fn test_bucket_policy() {
        let lod = LodPolicy::default();
        assert_eq!(lod.bucket_for(0.05).milli(), 100);
        assert_eq!(lod.bucket_for(0.1).milli(), 250);
        assert_eq!(lod.bucket_for(0.3).milli(), 500);
        assert_eq!(lod.bucket_for(0.75).milli(), 1000);
        assert_eq!(lod.bucket_for(1.5).milli(), 2000);
        assert_eq!(lod.bucket_for(3.2).milli(), 3000);
        assert_eq!(lod.bucket_for(49.0).milli(), 10000);
        // Nearby zooms share a bucket
        assert_eq!(lod.bucket_for(0.6), lod.bucket_for(0.9));
    }

    #[test]
    fn test_bucket_scale_matches_zoom_scale() {
        let lod = LodPolicy::default();
        for zoom in [0.02, 0.09, 0.12, 0.24, 0.3, 0.49, 0.7, 1.9, 6.0] {
            assert_eq!(lod.scale_for_bucket(lod.bucket_for(zoom)), lod.scale_for(zoom), "zoom {}", zoom);
        }
    }
}
