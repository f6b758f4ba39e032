//! Batch & cohort analytics over mastery state.

pub mod batch;
pub mod cohort;

pub use batch::{BatchScheduler, MasteryEvaluator, StudentEvaluator};
pub use cohort::{CohortComparison, CohortSample, GroupSummary, PairwiseComparison, compare};
