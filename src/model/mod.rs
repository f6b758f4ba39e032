//! Core data model.
//!
//! A learning event is one observed student action. Accepted events fold into
//! a mastery record per (student, component); everything else in the engine
//! (predictions, recommendations, batch jobs) is derived from those records.

pub mod batch;
pub mod event;
pub mod insight;
pub mod record;

pub use batch::{BatchId, BatchJob, BatchPriority, BatchStatus, StudentEvaluation, StudentFailure};
pub use event::{LearningEvent, MasteryUpdated, ScoreComponent, SubScores};
pub use insight::{Action, PredictionResult, Priority, Rationale, Recommendation};
pub use record::{History, MasteryRecord, Snapshot};
