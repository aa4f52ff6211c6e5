//! Screen map: a dedup grid suppressing geometries indistinguishable at the
//! current query resolution.
//!
//! When a feature's envelope collapses below the simplification distance, the
//! candidate reader asks the screen map whether that location is already
//! represented; if so the candidate is discarded before any further decode.

use crate::types::Envelope;

/// Fixed-resolution occupancy grid over a target envelope.
#[derive(Debug, Clone)]
pub struct ScreenMap {
    extent: Envelope,
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl ScreenMap {
    /// Grid of `width` x `height` cells spanning `extent`.
    ///
    /// # Panics
    ///
    /// Panics when either dimension is zero or `extent` is null; a screen map
    /// only makes sense for a concrete rendering target.
    #[must_use]
    pub fn new(extent: Envelope, width: u32, height: u32) -> Self {
        assert!(width > 0 && height > 0, "screen map needs a non-empty grid");
        assert!(!extent.is_null(), "screen map needs a concrete extent");
        let (width, height) = (width as usize, height as usize);
        Self {
            extent,
            width,
            height,
            cells: vec![false; width * height],
        }
    }

    /// Report whether the cell under `env`'s lower-left corner was already
    /// occupied, marking it occupied either way. Envelopes outside the extent
    /// are never considered represented.
    pub fn is_set_and_mark(&mut self, env: &Envelope) -> bool {
        if env.is_null() || !self.extent.intersects(env) {
            return false;
        }
        let col = self.cell(env.min_x, self.extent.min_x, self.extent.width(), self.width);
        let row = self.cell(env.min_y, self.extent.min_y, self.extent.height(), self.height);
        let idx = row * self.width + col;
        let seen = self.cells[idx];
        self.cells[idx] = true;
        seen
    }

    fn cell(&self, value: f64, origin: f64, span: f64, cells: usize) -> usize {
        if span <= 0.0 {
            return 0;
        }
        let fraction = ((value - origin) / span).clamp(0.0, 1.0);
        ((fraction * cells as f64) as usize).min(cells - 1)
    }
}
