//! Synchronous query API.
//!
//! Every operation returns [`ApiError`] on failure: a stable code, a message
//! safe to show a caller, and a retry hint where one applies. Internal detail
//! (dependency names, store keys, causes) goes to the log, never to the
//! caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use crate::analytics::{BatchScheduler, CohortComparison, CohortSample, compare};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{
    BatchId, BatchJob, BatchPriority, MasteryRecord, PredictionResult, Recommendation,
};
use crate::predict::Predictor;
use crate::recommend::{rank, recommend};
use crate::store::MasteryStore;

/// Caller-facing error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retry_after_ms: None,
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(_) | Error::NotFound(_) | Error::InsufficientHistory { .. } => {
                ApiError::new(e.code(), e.to_string())
            }
            Error::DependencyUnavailable { retry_after, .. } => {
                warn!(error = %e, "request rejected, dependency unavailable");
                ApiError {
                    retry_after_ms: Some(retry_after.as_millis() as u64),
                    ..ApiError::new(
                        "DEPENDENCY_UNAVAILABLE",
                        "a required service is temporarily unavailable",
                    )
                }
            }
            // Retries exhausted: surfaced as unavailable.
            Error::Dependency { .. }
            | Error::Timeout(_)
            | Error::Io(_)
            | Error::ConcurrentModification { .. }
            | Error::DeadLettered { .. } => {
                warn!(error = %e, "request failed after retries");
                ApiError::new(
                    "DEPENDENCY_UNAVAILABLE",
                    "a required service is temporarily unavailable",
                )
            }
            Error::PermanentFailure { ref event_id, .. } => {
                error!(error = %e, "permanent processing failure");
                ApiError::new(
                    e.code(),
                    format!("event {event_id} requires manual review"),
                )
            }
            Error::Serialization(_) | Error::Config(_) | Error::Other(_) => {
                error!(error = %e, "internal error");
                ApiError::new(e.code(), "internal error")
            }
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// A named group of students for cohort comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortGroup {
    pub name: String,
    pub student_ids: Vec<String>,
}

#[derive(Clone)]
pub struct MasteryService {
    store: MasteryStore,
    predictor: Arc<Predictor>,
    scheduler: BatchScheduler,
    config: Arc<EngineConfig>,
}

impl MasteryService {
    pub fn new(
        store: MasteryStore,
        predictor: Arc<Predictor>,
        scheduler: BatchScheduler,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            predictor,
            scheduler,
            config,
        }
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Every component record of a student, ordered by component.
    pub async fn get_mastery(&self, student_id: &str) -> ApiResult<Vec<MasteryRecord>> {
        Ok(self.records(student_id).await?)
    }

    pub async fn get_prediction(
        &self,
        student_id: &str,
        component: &str,
        horizon_days: u32,
    ) -> ApiResult<PredictionResult> {
        let record = self
            .store
            .load(student_id, component)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no mastery record for student {student_id}, component {component}"
                ))
            })?
            .value;
        Ok(self.predictor.predict(&record, horizon_days)?)
    }

    /// Recommendations across all components. Components without enough
    /// history are judged on their sub-scores alone.
    pub async fn get_recommendations(&self, student_id: &str) -> ApiResult<Vec<Recommendation>> {
        let horizon = self.config.batch.horizon_days;
        let mut out = Vec::new();
        for record in self.records(student_id).await? {
            let prediction = match self.predictor.predict(&record, horizon) {
                Ok(p) => Some(p),
                Err(Error::InsufficientHistory { .. }) => None,
                Err(e) => return Err(e.into()),
            };
            out.extend(recommend(&record, prediction.as_ref(), &self.config.recommend));
        }
        rank(&mut out);
        Ok(out)
    }

    pub fn submit_batch(&self, student_ids: Vec<String>, priority: &str) -> ApiResult<BatchId> {
        let priority: BatchPriority = priority.parse()?;
        Ok(self.scheduler.submit(student_ids, priority)?)
    }

    pub fn get_batch_status(&self, batch_id: &str) -> ApiResult<BatchJob> {
        Ok(self.scheduler.status(&parse_batch_id(batch_id)?)?)
    }

    pub fn cancel_batch(&self, batch_id: &str) -> ApiResult<BatchJob> {
        let id = parse_batch_id(batch_id)?;
        self.scheduler.cancel(&id)?;
        Ok(self.scheduler.status(&id)?)
    }

    /// Compare mastery across groups. With `component` set, each student's
    /// value is that component's mastery; otherwise the mean over their
    /// components. Students without records don't contribute a value.
    pub async fn compare_cohorts(
        &self,
        groups: &[CohortGroup],
        component: Option<&str>,
    ) -> ApiResult<CohortComparison> {
        let mut samples = Vec::with_capacity(groups.len());
        for group in groups {
            let students: BTreeSet<&str> = group.student_ids.iter().map(String::as_str).collect();
            let mut values = Vec::with_capacity(students.len());
            for student_id in students {
                if let Some(value) = self.student_value(student_id, component).await? {
                    values.push(value);
                }
            }
            samples.push(CohortSample::new(group.name.clone(), values));
        }
        Ok(compare(&samples, &self.config.cohort)?)
    }

    /// Schedule erasure of every record of a student.
    pub async fn erase_student(&self, student_id: &str, ttl: Duration) -> ApiResult<usize> {
        Ok(self.store.erase_student(student_id, ttl).await?)
    }

    async fn records(&self, student_id: &str) -> Result<Vec<MasteryRecord>> {
        if student_id.trim().is_empty() {
            return Err(Error::Validation("student_id is empty".to_string()));
        }
        let records = self.store.list_for_student(student_id).await?;
        if records.is_empty() {
            return Err(Error::NotFound(format!(
                "no mastery records for student {student_id}"
            )));
        }
        Ok(records)
    }

    async fn student_value(&self, student_id: &str, component: Option<&str>) -> Result<Option<f64>> {
        match component {
            Some(component) => Ok(self
                .store
                .load(student_id, component)
                .await?
                .map(|v| v.value.mastery)),
            None => {
                let records = self.store.list_for_student(student_id).await?;
                if records.is_empty() {
                    return Ok(None);
                }
                let total: f64 = records.iter().map(|r| r.mastery).sum();
                Ok(Some(total / records.len() as f64))
            }
        }
    }
}

fn parse_batch_id(raw: &str) -> Result<BatchId> {
    Uuid::parse_str(raw.trim())
        .map(BatchId)
        .map_err(|_| Error::Validation(format!("invalid batch id: {raw}")))
}
