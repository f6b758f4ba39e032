//! Batch re-evaluation jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::insight::{PredictionResult, Recommendation};
use crate::error::Error;

/// Newtype for batch job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered so that `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchPriority {
    Low,
    Normal,
    High,
}

impl std::str::FromStr for BatchPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(BatchPriority::High),
            "normal" => Ok(BatchPriority::Normal),
            "low" => Ok(BatchPriority::Low),
            _ => Err(Error::Validation(format!("unknown batch priority: {s}"))),
        }
    }
}

impl std::fmt::Display for BatchPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchPriority::High => "HIGH",
            BatchPriority::Normal => "NORMAL",
            BatchPriority::Low => "LOW",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    /// Every student in the job failed.
    Failed,
    /// Stopped between students on request; partial results are kept.
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Everything computed for one student in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentEvaluation {
    pub student_id: String,
    pub predictions: Vec<PredictionResult>,
    pub recommendations: Vec<Recommendation>,
}

/// Why one student in a batch could not be evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentFailure {
    pub student_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub batch_id: BatchId,
    pub student_ids: BTreeSet<String>,
    pub priority: BatchPriority,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_count: usize,
    pub results: Vec<StudentEvaluation>,
    pub failures: Vec<StudentFailure>,
}

impl BatchJob {
    pub fn new(student_ids: BTreeSet<String>, priority: BatchPriority) -> Self {
        Self {
            batch_id: BatchId::new(),
            student_ids,
            priority,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            error_count: 0,
            results: Vec::new(),
            failures: Vec::new(),
        }
    }
}
