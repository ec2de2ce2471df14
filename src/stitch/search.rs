//! Coordinate-descent search over per-fragment rigid transforms.
//!
//! One `step()` is one iteration: every fragment in order tries
//! translation (±step_t in x and y) and rotation (±step_r about the center of
//! its overlap with the other fragments) moves, keeps the best improving one, then re-evaluates its horizontal flip.
//! The first fragment is the anchor: only its flip may change.
//!
//! Iterations that improve the objective by less than the convergence
//! threshold halve both steps; once both are under their minimums the
//! session is converged.

use indexmap::IndexMap;
use glam::DVec2;
use log::{debug, info};
use rayon::prelude::*;

use crate::entities::{FragmentId, FragmentSnapshot, RigidTransform};

use super::score::{LumaPlane, Placed, pair_score};
use super::{StitchConfig, StitchResult, StitchStatus};

const EPS: f64 = 1e-9;

/// Index of the fragment whose pose is held fixed
const ANCHOR: usize = 0;

/// Outcome of one `step()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Objective gain of the iteration (may be zero)
    Refined(f64),
    Converged,
}

pub struct StitchSession {
    config: StitchConfig,
    ids: Vec<FragmentId>,
    planes: Vec<LumaPlane>,
    /// Guesses exactly as supplied, returned untouched for degenerate input
    supplied: Vec<RigidTransform>,
    initial: Vec<RigidTransform>,
    current: Vec<RigidTransform>,
    initial_scores: Vec<f64>,
    initial_objective: f64,
    objective: f64,
    step_t: f64,
    step_r: f64,
    iterations: usize,
    converged: bool,
    degenerate: bool,
}

impl StitchSession {
    /// Prepare a search. Fragments without a guess start from their current transform.
    pub fn new(
        snapshots: &[FragmentSnapshot],
        guesses: &IndexMap<FragmentId, RigidTransform>,
        config: StitchConfig,
    ) -> Self {
        let ids: Vec<FragmentId> = snapshots.iter().map(|s| s.id).collect();
        let supplied: Vec<RigidTransform> = snapshots
            .iter()
            .map(|s| guesses.get(&s.id).copied().unwrap_or(s.transform))
            .collect();
        let initial: Vec<RigidTransform> = supplied.iter().map(|t| t.normalized()).collect();
        let planes: Vec<LumaPlane> = snapshots
            .par_iter()
            .map(|s| LumaPlane::from_image(&s.image, config.max_plane_side))
            .collect();

        let mut session = Self {
            step_t: config.translation_step,
            step_r: config.rotation_step,
            config,
            ids,
            planes,
            supplied,
            current: initial.clone(),
            initial,
            initial_scores: Vec::new(),
            initial_objective: 0.0,
            objective: 0.0,
            iterations: 0,
            converged: false,
            degenerate: false,
        };

        session.degenerate = session.check_degenerate();
        if !session.degenerate {
            session.initial_scores = session.fragment_scores(&session.current);
            session.initial_objective = session.total(&session.current);
            session.objective = session.initial_objective;
        } else {
            session.initial_scores = vec![0.0; session.ids.len()];
        }
        session
    }

    /// Fewer than two fragments, missing content, or no overlapping pair.
    fn check_degenerate(&self) -> bool {
        if self.ids.len() < 2 {
            debug!("Stitch: degenerate, {} fragment(s)", self.ids.len());
            return true;
        }
        if self.planes.iter().any(|p| p.is_empty()) {
            debug!("Stitch: degenerate, fragment without content");
            return true;
        }
        let boxes: Vec<_> = self
            .planes
            .iter()
            .zip(&self.current)
            .map(|(p, t)| t.bounding_box(p.raw_size().0, p.raw_size().1))
            .collect();
        let any_overlap = (0..boxes.len())
            .any(|i| (i + 1..boxes.len()).any(|j| boxes[i].intersects(&boxes[j])));
        if !any_overlap {
            debug!("Stitch: degenerate, no overlapping pair");
        }
        !any_overlap
    }

    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn objective(&self) -> f64 {
        self.objective
    }

    pub fn initial_objective(&self) -> f64 {
        self.initial_objective
    }

    pub fn steps(&self) -> (f64, f64) {
        (self.step_t, self.step_r)
    }

    /// Current transforms in fragment order.
    pub fn transforms(&self) -> IndexMap<FragmentId, RigidTransform> {
        self.ids.iter().copied().zip(self.current.iter().copied()).collect()
    }

    // === Scoring ===

    fn placed<'a>(&'a self, transforms: &[RigidTransform]) -> Vec<Placed<'a>> {
        self.planes
            .iter()
            .zip(transforms)
            .map(|(p, t)| Placed::new(p, t))
            .collect()
    }

    /// Score of fragment `i` placed at `candidate`, others at `transforms`.
    fn score_with(&self, i: usize, candidate: &RigidTransform, transforms: &[RigidTransform]) -> f64 {
        let moved = Placed::new(&self.planes[i], candidate);
        (0..self.planes.len())
            .filter(|j| *j != i)
            .map(|j| {
                let other = Placed::new(&self.planes[j], &transforms[j]);
                pair_score(&moved, &other, &self.config)
            })
            .sum()
    }

    /// Per-fragment scores (sum over pairs containing the fragment).
    pub fn fragment_scores(&self, transforms: &[RigidTransform]) -> Vec<f64> {
        let placed = self.placed(transforms);
        let n = placed.len();
        let pairs: Vec<(usize, usize, f64)> = (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(i, j)| (i, j, pair_score(&placed[i], &placed[j], &self.config)))
            .collect();
        let mut scores = vec![0.0; n];
        for (i, j, s) in pairs {
            scores[i] += s;
            scores[j] += s;
        }
        scores
    }

    /// Global objective: sum of pair scores.
    pub fn total(&self, transforms: &[RigidTransform]) -> f64 {
        self.fragment_scores(transforms).iter().sum::<f64>() / 2.0
    }

    // === Search ===

    /// Center of the region where fragment `i` overlaps the others.
    ///
    /// Rotating about it leaves the matched content in place.
    fn pivot(&self, i: usize, transforms: &[RigidTransform]) -> DVec2 {
        let (w, h) = self.planes[i].raw_size();
        let own = transforms[i].bounding_box(w, h);
        let overlap = (0..self.planes.len())
            .filter(|j| *j != i)
            .filter_map(|j| {
                let (wj, hj) = self.planes[j].raw_size();
                own.intersection(&transforms[j].bounding_box(wj, hj))
            })
            .reduce(|a, b| a.union(&b));
        match overlap {
            Some(r) => DVec2::new(r.x + r.width * 0.5, r.y + r.height * 0.5),
            None => transforms[i].center(w, h),
        }
    }

    fn candidates(&self, t: &RigidTransform, i: usize) -> Vec<RigidTransform> {
        let mut out = Vec::with_capacity(6);
        for (dx, dy) in [(self.step_t, 0.0), (-self.step_t, 0.0), (0.0, self.step_t), (0.0, -self.step_t)] {
            out.push(RigidTransform {
                x: t.x + dx,
                y: t.y + dy,
                ..*t
            });
        }
        if self.config.allow_rotation {
            let (w, h) = self.planes[i].raw_size();
            let pivot = self.pivot(i, &self.current);
            out.push(t.rotated_about(self.step_r, pivot, w, h));
            out.push(t.rotated_about(-self.step_r, pivot, w, h));
        }
        out
    }

    /// Run one iteration.
    pub fn step(&mut self) -> StepOutcome {
        if self.converged || self.degenerate {
            return StepOutcome::Converged;
        }
        let before = self.objective;

        for i in 0..self.current.len() {
            let current = self.current[i];
            let mut best_score = self.score_with(i, &current, &self.current);
            let mut best = current;

            if i != ANCHOR {
                let candidates = self.candidates(&current, i);
                let scored: Vec<(f64, RigidTransform)> = candidates
                    .par_iter()
                    .map(|c| (self.score_with(i, c, &self.current), *c))
                    .collect();
                for (score, cand) in scored {
                    if score > best_score + EPS {
                        best_score = score;
                        best = cand;
                    }
                }
            }

            if self.config.allow_flip {
                let flipped = RigidTransform {
                    flip_horizontal: !best.flip_horizontal,
                    ..best
                };
                let score = self.score_with(i, &flipped, &self.current);
                if score > best_score + EPS {
                    best = flipped;
                }
            }

            self.current[i] = best.normalized();
        }

        self.objective = self.total(&self.current);
        self.iterations += 1;
        let gain = self.objective - before;

        if gain < self.config.convergence_threshold {
            self.step_t *= 0.5;
            self.step_r *= 0.5;
            if self.step_t < self.config.min_translation_step
                && (self.step_r < self.config.min_rotation_step || !self.config.allow_rotation)
            {
                self.converged = true;
            }
        }
        debug!(
            "Stitch iteration {}: objective {:.5} (gain {:.5}), steps t={} r={}",
            self.iterations, self.objective, gain, self.step_t, self.step_r
        );

        if self.converged {
            StepOutcome::Converged
        } else {
            StepOutcome::Refined(gain)
        }
    }

    /// Apply the non-worsening guard and build the result.
    ///
    /// Fragments that ended below their initial-guess score are reverted,
    /// repeatedly until stable. If a reverted fragment is still worse, or the
    /// global objective fell below its initial value, everything reverts.
    pub fn finish(mut self, status: StitchStatus) -> StitchResult {
        if self.degenerate {
            let transforms = self.ids.iter().copied().zip(self.supplied.iter().copied()).collect();
            return StitchResult {
                transforms,
                status: StitchStatus::Degenerate,
                iterations: 0,
                initial_objective: 0.0,
                final_objective: 0.0,
                initial_scores: self.ids.iter().copied().zip(self.initial_scores.iter().copied()).collect(),
                final_scores: self.ids.iter().copied().zip(self.initial_scores.iter().copied()).collect(),
                reverted: Vec::new(),
            };
        }

        let n = self.current.len();
        let mut reverted = vec![false; n];
        let mut revert_all = false;

        loop {
            let scores = self.fragment_scores(&self.current);
            let mut changed = false;
            for i in 0..n {
                if scores[i] + EPS >= self.initial_scores[i] {
                    continue;
                }
                if reverted[i] {
                    revert_all = true;
                    break;
                }
                self.current[i] = self.initial[i];
                reverted[i] = true;
                changed = true;
            }
            if revert_all || !changed {
                break;
            }
        }

        if !revert_all && self.total(&self.current) + EPS < self.initial_objective {
            revert_all = true;
        }
        if revert_all {
            self.current = self.initial.clone();
            reverted = vec![true; n];
        }

        let final_scores = self.fragment_scores(&self.current);
        let final_objective = final_scores.iter().sum::<f64>() / 2.0;
        let reverted_ids: Vec<FragmentId> = self
            .ids
            .iter()
            .zip(&reverted)
            .filter(|(_, r)| **r)
            .map(|(id, _)| *id)
            .collect();

        info!(
            "Stitch finished: {:?} after {} iterations, objective {:.5} -> {:.5}, {} reverted",
            status,
            self.iterations,
            self.initial_objective,
            final_objective,
            reverted_ids.len()
        );

        StitchResult {
            transforms: self.transforms(),
            status,
            iterations: self.iterations,
            initial_objective: self.initial_objective,
            final_objective,
            initial_scores: self.ids.iter().copied().zip(self.initial_scores.iter().copied()).collect(),
            final_scores: self.ids.iter().copied().zip(final_scores).collect(),
            reverted: reverted_ids,
        }
    }
}
