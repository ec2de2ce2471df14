//! Canvas viewport: zoom + pan between world and screen space.
//!
//! `screen = (world + pan) * zoom`, y-down in both spaces.

use glam::DVec2;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::entities::BoundingBox;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub min_zoom: f64,
    pub max_zoom: f64,
    /// Multiplier per wheel notch
    pub zoom_step: f64,
    /// Fraction of the view filled by zoom-to-fit
    pub fit_padding: f64,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            min_zoom: 0.01,
            max_zoom: 50.0,
            zoom_step: 1.2,
            fit_padding: 0.9,
        }
    }
}

/// Viewport state for pan/zoom
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportState {
    zoom: f64,
    pan: DVec2,
    /// Widget size in screen pixels
    size: DVec2,
    config: ViewportConfig,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self::new(ViewportConfig::default())
    }
}

impl ViewportState {
    pub fn new(config: ViewportConfig) -> Self {
        Self {
            zoom: 1.0,
            pan: DVec2::ZERO,
            size: DVec2::new(1280.0, 720.0),
            config,
        }
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn pan(&self) -> DVec2 {
        self.pan
    }

    pub fn size(&self) -> DVec2 {
        self.size
    }

    pub fn set_size(&mut self, width: f64, height: f64) {
        self.size = DVec2::new(width.max(1.0), height.max(1.0));
    }

    /// Set zoom (clamped). Returns true if it changed.
    pub fn set_zoom(&mut self, zoom: f64) -> bool {
        let z = if zoom.is_finite() { zoom } else { 1.0 };
        let z = z.clamp(self.config.min_zoom, self.config.max_zoom);
        let changed = z != self.zoom;
        self.zoom = z;
        changed
    }

    pub fn set_pan(&mut self, x: f64, y: f64) {
        self.pan = DVec2::new(x, y);
    }

    pub fn screen_to_world(&self, screen: DVec2) -> DVec2 {
        screen / self.zoom - self.pan
    }

    pub fn world_to_screen(&self, world: DVec2) -> DVec2 {
        (world + self.pan) * self.zoom
    }

    /// Zoom by `steps` wheel notches keeping the world point under `cursor` fixed.
    pub fn zoom_at(&mut self, steps: f64, cursor: DVec2) -> bool {
        let before = self.screen_to_world(cursor);
        if !self.set_zoom(self.zoom * self.config.zoom_step.powf(steps)) {
            return false;
        }
        let after = self.screen_to_world(cursor);
        self.pan += after - before;
        debug!("Zoom: {:.3}x, Pan: ({:.1}, {:.1})", self.zoom, self.pan.x, self.pan.y);
        true
    }

    /// Pan by a screen-space delta.
    pub fn pan_by(&mut self, screen_delta: DVec2) {
        self.pan += screen_delta / self.zoom;
    }

    /// Fit `bounds` into the view with padding and center it.
    pub fn zoom_to_fit(&mut self, bounds: &BoundingBox) -> bool {
        if bounds.width <= 0.0 || bounds.height <= 0.0 {
            return false;
        }
        let zoom_x = self.size.x / bounds.width;
        let zoom_y = self.size.y / bounds.height;
        self.set_zoom(zoom_x.min(zoom_y) * self.config.fit_padding);

        let center = DVec2::new(bounds.x + bounds.width / 2.0, bounds.y + bounds.height / 2.0);
        self.pan = self.size / 2.0 / self.zoom - center;
        debug!("Zoom to fit: {:.3}x", self.zoom);
        true
    }

    /// 100% zoom, world origin at the top-left corner.
    pub fn zoom_to_100(&mut self) {
        self.zoom = 1.0_f64.clamp(self.config.min_zoom, self.config.max_zoom);
        self.pan = DVec2::ZERO;
    }

    /// World rectangle currently on screen.
    pub fn visible_world_rect(&self) -> BoundingBox {
        let tl = self.screen_to_world(DVec2::ZERO);
        BoundingBox::new(tl.x, tl.y, self.size.x / self.zoom, self.size.y / self.zoom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zoom_clamped() {
        let mut vp = ViewportState::default();
        vp.set_zoom(1000.0);
        assert_eq!(vp.zoom(), 50.0);
        vp.set_zoom(0.0);
        assert_eq!(vp.zoom(), 0.01);
        assert!(!vp.set_zoom(0.001));
    }

    #[test]
    fn test_zoom_at_keeps_cursor_point() {
        let mut vp = ViewportState::default();
        vp.set_pan(-30.0, 12.0);
        let cursor = DVec2::new(400.0, 250.0);
        let before = vp.screen_to_world(cursor);
        assert!(vp.zoom_at(3.0, cursor));
        assert!((vp.zoom() - 1.2f64.powi(3)).abs() < 1e-9);
        assert!((vp.screen_to_world(cursor) - before).length() < 1e-9);
    }

    #[test]
    fn test_world_screen_roundtrip() {
        let mut vp = ViewportState::default();
        vp.set_zoom(0.37);
        vp.pan_by(DVec2::new(15.0, -4.0));
        let w = DVec2::new(123.5, -77.25);
        assert!((vp.screen_to_world(vp.world_to_screen(w)) - w).length() < 1e-9);
    }

    #[test]
    fn test_zoom_to_fit_centers_content() {
        let mut vp = ViewportState::default();
        vp.set_size(1000.0, 500.0);
        let bounds = BoundingBox::new(100.0, 100.0, 2000.0, 500.0);
        assert!(vp.zoom_to_fit(&bounds));
        assert!((vp.zoom() - 0.45).abs() < 1e-9);
        let center = vp.world_to_screen(DVec2::new(1100.0, 350.0));
        assert!((center - DVec2::new(500.0, 250.0)).length() < 1e-9);
        let visible = vp.visible_world_rect();
        assert!(visible.x <= bounds.x && visible.right() >= bounds.right());

        vp.zoom_to_100();
        assert_eq!(vp.zoom(), 1.0);
        assert_eq!(vp.pan(), DVec2::ZERO);
    }
}
