//! Predictor: short-horizon mastery projections with a TTL cache.
//!
//! The fit itself lives in [`trend`] and is pure. [`Predictor`] adds the
//! per-(student, component, horizon) cache. Entries remember the record's
//! `updated_at` they were computed from, so any newly applied event makes the
//! cached projection stale without explicit invalidation.

pub mod trend;

pub use trend::{Forecast, Line, forecast};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::KeyValue;
use std::time::Instant;
use tracing::debug;

use crate::config::PredictorConfig;
use crate::error::{Error, Result};
use crate::model::{MasteryRecord, PredictionResult};
use crate::telemetry::metrics;

type CacheKey = (String, String, u32);

struct CachedPrediction {
    based_on: DateTime<Utc>,
    cached_at: Instant,
    result: PredictionResult,
}

pub struct Predictor {
    config: PredictorConfig,
    cache: DashMap<CacheKey, CachedPrediction>,
}

impl Predictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            cache: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// Project `record` forward `horizon_days` days.
    pub fn predict(&self, record: &MasteryRecord, horizon_days: u32) -> Result<PredictionResult> {
        let key = (
            record.student_id.clone(),
            record.component.clone(),
            horizon_days,
        );

        if let Some(hit) = self.lookup(&key, record.updated_at) {
            metrics::predictions().add(
                1,
                &[KeyValue::new("cache", "hit"), KeyValue::new("result", "ok")],
            );
            return Ok(hit);
        }

        let result = self.compute(record, horizon_days);
        let label = match &result {
            Ok(_) => "ok",
            Err(Error::InsufficientHistory { .. }) => "insufficient_history",
            Err(_) => "error",
        };
        metrics::predictions().add(
            1,
            &[KeyValue::new("cache", "miss"), KeyValue::new("result", label)],
        );

        let prediction = result?;
        self.cache.insert(
            key,
            CachedPrediction {
                based_on: record.updated_at,
                cached_at: Instant::now(),
                result: prediction.clone(),
            },
        );
        Ok(prediction)
    }

    fn compute(&self, record: &MasteryRecord, horizon_days: u32) -> Result<PredictionResult> {
        let history = record.history.to_vec();
        let f = forecast(&history, horizon_days, &self.config)?;
        debug!(
            student_id = %record.student_id,
            component = %record.component,
            horizon_days,
            slope = f.line.slope,
            confidence = f.confidence,
            outliers_removed = f.outliers_removed,
            "prediction computed"
        );
        Ok(PredictionResult {
            student_id: record.student_id.clone(),
            component: record.component.clone(),
            horizon_days,
            projected_mastery: f.projected_mastery,
            confidence: f.confidence,
            trajectory: f.trajectory,
            intervention_flag: f.intervention_flag,
            based_on: record.updated_at,
        })
    }

    fn lookup(&self, key: &CacheKey, updated_at: DateTime<Utc>) -> Option<PredictionResult> {
        let entry = self.cache.get(key)?;
        let fresh =
            entry.based_on == updated_at && entry.cached_at.elapsed() < self.config.cache_ttl();
        fresh.then(|| entry.result.clone())
    }

    /// Drop entries older than the cache TTL. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.config.cache_ttl();
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        before - self.cache.len()
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LearningEvent, SubScores};
    use chrono::{Duration, TimeZone};

    fn record_with_days(days: i64) -> MasteryRecord {
        let mut record = MasteryRecord::new("s1", "loops", 90);
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap();
        for day in 0..days {
            let score = 0.3 + 0.05 * day as f64;
            record.apply(
                &LearningEvent {
                    event_id: format!("e{day}"),
                    student_id: "s1".into(),
                    component: "loops".into(),
                    scores: SubScores::new(score, score, score, score),
                    occurred_at: start + Duration::days(day),
                    idempotency_key: format!("k{day}"),
                    correction: false,
                },
                64,
            );
        }
        record
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let predictor = Predictor::new(PredictorConfig::default());
        let record = record_with_days(5);

        let first = predictor.predict(&record, 7).unwrap();
        let second = predictor.predict(&record, 7).unwrap();
        assert_eq!(first, second);
        assert_eq!(predictor.cached(), 1);
        assert_eq!(first.trajectory.len(), 7);
        assert_eq!(first.based_on, record.updated_at);
    }

    #[test]
    fn a_newer_record_bypasses_the_cached_entry() {
        let predictor = Predictor::new(PredictorConfig::default());
        let older = predictor.predict(&record_with_days(4), 3).unwrap();
        let newer = predictor.predict(&record_with_days(6), 3).unwrap();

        assert_ne!(older.based_on, newer.based_on);
        assert!(newer.projected_mastery > older.projected_mastery);
        assert_eq!(predictor.cached(), 1);
    }

    #[test]
    fn insufficient_history_is_not_cached() {
        let predictor = Predictor::new(PredictorConfig::default());
        let err = predictor.predict(&record_with_days(2), 7).unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_HISTORY");
        assert_eq!(predictor.cached(), 0);
    }

    #[test]
    fn zero_ttl_expires_everything() {
        let predictor = Predictor::new(PredictorConfig {
            cache_ttl_secs: 0,
            ..PredictorConfig::default()
        });
        predictor.predict(&record_with_days(3), 2).unwrap();
        assert_eq!(predictor.evict_expired(), 1);
        assert_eq!(predictor.cached(), 0);
    }
}
