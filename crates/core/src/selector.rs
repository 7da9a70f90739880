//! Strength-calibrated move selection
//!
//! Instead of always playing the engine's top line, the selector picks the
//! weakest candidate whose evaluation stays within an error budget of the
//! best one. The budget grows as strength drops.

use std::cmp::Ordering;
use std::fmt;

use crate::engine::Candidate;
use crate::error::{Error, Result};

/// How close to best play the selection stays: 1.0 = best, 0.0 = weakest allowed
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Strength(f64);

impl Strength {
    pub const FULL: Strength = Strength(1.0);

    pub fn new(value: f64) -> Result<Self> {
        if (0.0..=1.0).contains(&value) {
            Ok(Strength(value))
        } else {
            Err(Error::InvalidStrength(value))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for Strength {
    fn default() -> Self {
        Strength::FULL
    }
}

impl TryFrom<f64> for Strength {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        Strength::new(value)
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// How far below the best evaluation a selection may fall.
///
/// Losing positions get twice the relative slack.
pub fn error_budget(best: f64, strength: Strength) -> f64 {
    let slack = 1.0 - strength.value();
    if best >= 0.0 {
        slack * best
    } else {
        -2.0 * slack * best
    }
}

/// Best first; equal evaluations keep the lower multipv index first
fn by_eval_desc(a: &Candidate, b: &Candidate) -> Ordering {
    b.eval.total_cmp(&a.eval).then(a.multipv.cmp(&b.multipv))
}

fn by_eval_asc(a: &Candidate, b: &Candidate) -> Ordering {
    a.eval.total_cmp(&b.eval).then(a.multipv.cmp(&b.multipv))
}

/// Picks the recommended move, or `None` when there are no candidates
pub fn select(candidates: &[Candidate], strength: Strength) -> Option<&Candidate> {
    let mut ranked: Vec<&Candidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| by_eval_desc(a, b));

    let best = ranked.first()?.eval;
    let threshold = best - error_budget(best, strength);
    pick(&ranked, threshold)
}

/// Weakest candidate at or above `threshold`, falling back to the top one
fn pick<'a>(ranked: &[&'a Candidate], threshold: f64) -> Option<&'a Candidate> {
    ranked
        .iter()
        .copied()
        .filter(|c| c.eval >= threshold)
        .min_by(|a, b| by_eval_asc(a, b))
        .or_else(|| ranked.first().copied())
}
