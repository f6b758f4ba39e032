//! Mastery calculator: the single source of truth for how sub-scores weigh
//! into a mastery value. Pure, no I/O.

use crate::model::SubScores;

// Fixed for now; per-cohort weighting would be configured here.
pub const COMPLETION_WEIGHT: f64 = 0.40;
pub const QUIZ_WEIGHT: f64 = 0.30;
pub const QUALITY_WEIGHT: f64 = 0.20;
pub const CONSISTENCY_WEIGHT: f64 = 0.10;

/// Allowed drift between a stored mastery value and the formula.
pub const TOLERANCE: f64 = 1e-9;

/// Weighted mastery. Inputs are expected in [0, 1]; the output then is too.
pub fn compute(completion: f64, quiz: f64, quality: f64, consistency: f64) -> f64 {
    COMPLETION_WEIGHT * completion
        + QUIZ_WEIGHT * quiz
        + QUALITY_WEIGHT * quality
        + CONSISTENCY_WEIGHT * consistency
}

pub fn weighted(scores: &SubScores) -> f64 {
    compute(
        scores.completion,
        scores.quiz,
        scores.quality,
        scores.consistency,
    )
}
