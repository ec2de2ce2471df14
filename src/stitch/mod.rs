//! Rigid stitching - refine fragment placements so overlaps agree.
//!
//! **Why**: users drop scanned fragments roughly in place; the stitcher
//! nudges rotation, translation and mirror state until the overlapping
//! tissue lines up, and never hands back a placement scoring worse than the
//! user's guess.
//!
//! **Used by**: CLI `--stitch`, and any caller holding a [`FragmentManager`]:
//! snapshot -> [`RigidStitcher::stitch`] -> `apply_transforms`.
//!
//! The search is a bounded, resumable [`StitchSession`]; `stitch()` drives it
//! under a [`StitchBudget`] (iterations, wall time, cancel token) and checks
//! the budget between iterations.

pub mod score;
pub mod search;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::entities::{FragmentError, FragmentId, FragmentManager, FragmentSnapshot, RigidTransform};

pub use score::{LumaPlane, Placed, pair_score};
pub use search::{StepOutcome, StitchSession};

/// Search tuning. Distances are world pixels, angles degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    pub max_iterations: usize,
    pub translation_step: f64,
    pub min_translation_step: f64,
    pub rotation_step: f64,
    pub min_rotation_step: f64,
    /// Iteration gain under which steps are halved
    pub convergence_threshold: f64,
    /// Sample cap per pair overlap
    pub max_samples: usize,
    /// Fewer valid samples score the pair 0
    pub min_overlap_samples: usize,
    /// Overlap area (px^2) at which the size damping is 0.5
    pub overlap_half_weight: f64,
    /// Luma planes are downscaled to this longest side (0 = full size)
    pub max_plane_side: usize,
    pub allow_rotation: bool,
    pub allow_flip: bool,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            translation_step: 4.0,
            min_translation_step: 0.25,
            rotation_step: 2.0,
            min_rotation_step: 0.125,
            convergence_threshold: 1e-4,
            max_samples: 4096,
            min_overlap_samples: 32,
            overlap_half_weight: 500.0,
            max_plane_side: 1024,
            allow_rotation: true,
            allow_flip: true,
        }
    }
}

/// Cooperative cancellation flag, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller-supplied limits for one `stitch()` run.
#[derive(Debug, Clone, Default)]
pub struct StitchBudget {
    /// Overrides `StitchConfig::max_iterations`
    pub max_iterations: Option<usize>,
    pub time_limit: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StitchStatus {
    Converged,
    MaxIterations,
    /// Time budget exhausted
    Budget,
    Cancelled,
    /// Under two fragments, missing content or nothing overlaps
    Degenerate,
}

#[derive(Debug, Clone)]
pub struct StitchResult {
    /// Refined transform per fragment, in input order, rotation in [0, 360).
    /// Degenerate runs return the guesses exactly as supplied.
    pub transforms: IndexMap<FragmentId, RigidTransform>,
    pub status: StitchStatus,
    pub iterations: usize,
    pub initial_objective: f64,
    pub final_objective: f64,
    pub initial_scores: IndexMap<FragmentId, f64>,
    pub final_scores: IndexMap<FragmentId, f64>,
    /// Fragments put back to their initial guess by the non-worsening guard
    pub reverted: Vec<FragmentId>,
}

impl StitchResult {
    /// One-line outcome for logs.
    pub fn summary(&self) -> String {
        match self.status {
            StitchStatus::Degenerate if self.transforms.len() < 2 => format!(
                "Stitch skipped: needs at least two fragments with content, got {}",
                self.transforms.len()
            ),
            StitchStatus::Degenerate => "Stitch skipped: no two fragments overlap".to_string(),
            status => format!(
                "Stitch {:?} after {} iteration(s): objective {:.4} -> {:.4}",
                status, self.iterations, self.initial_objective, self.final_objective
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RigidStitcher {
    config: StitchConfig,
}

impl RigidStitcher {
    pub fn new(config: StitchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StitchConfig {
        &self.config
    }

    /// Refine `guesses` for `snapshots` (missing guesses use the snapshot transform).
    pub fn stitch(
        &self,
        snapshots: &[FragmentSnapshot],
        guesses: &IndexMap<FragmentId, RigidTransform>,
        budget: &StitchBudget,
    ) -> StitchResult {
        let mut session = StitchSession::new(snapshots, guesses, self.config.clone());
        if session.is_degenerate() {
            return session.finish(StitchStatus::Degenerate);
        }

        let max_iterations = budget.max_iterations.unwrap_or(self.config.max_iterations);
        let started = Instant::now();
        let status = loop {
            if budget.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                break StitchStatus::Cancelled;
            }
            if session.iterations() >= max_iterations {
                break StitchStatus::MaxIterations;
            }
            if budget.time_limit.is_some_and(|limit| started.elapsed() >= limit) {
                break StitchStatus::Budget;
            }
            if session.step() == StepOutcome::Converged {
                break StitchStatus::Converged;
            }
        };
        session.finish(status)
    }

    /// Snapshot the manager, stitch, and apply the result in one batch.
    pub fn stitch_manager(
        &self,
        manager: &mut FragmentManager,
        guesses: &IndexMap<FragmentId, RigidTransform>,
        budget: &StitchBudget,
    ) -> Result<StitchResult, FragmentError> {
        let snapshots = manager.snapshot();
        let result = self.stitch(&snapshots, guesses, budget);
        if result.status != StitchStatus::Degenerate {
            manager.apply_transforms(&result.transforms)?;
        }
        Ok(result)
    }
}

/// Non-periodic RGB test texture sampled from global column `x + x_off`.
#[cfg(test)]
pub(crate) fn texture(w: usize, h: usize, x_off: usize) -> crate::entities::ImageBuffer {
    let mut px = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let (xf, yf) = ((x + x_off) as f64, y as f64);
            let v = 128.0
                + 40.0 * (xf / 5.0 + 0.3).sin()
                + 30.0 * (yf / 7.0 + 1.1).sin()
                + 25.0 * ((xf + 2.0 * yf) / 11.0).sin()
                + 20.0 * ((3.0 * xf - yf) / 13.0).cos()
                - ((xf - 90.0).powi(2) + (yf - 40.0).powi(2)) / 900.0;
            let v = v.clamp(0.0, 255.0) as u8;
            px.extend_from_slice(&[v, v / 2 + 60, 255 - v]);
        }
    }
    crate::entities::ImageBuffer::from_rgb8(px, w, h).unwrap()
}
