//! Engine tuning knobs.
//!
//! Every section is `#[serde(default)]`, so a TOML file only needs the keys
//! it wants to override:
//!
//! ```toml
//! timeout_ms = 1500
//!
//! [breaker]
//! failure_threshold = 3
//! cooldown_ms = 10000
//!
//! [batch]
//! workers = 8
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard bound on a single dependency call attempt.
    pub timeout_ms: u64,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub ingest: IngestConfig,
    pub predictor: PredictorConfig,
    pub recommend: RecommendConfig,
    pub batch: BatchConfig,
    pub cohort: CohortConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            ingest: IngestConfig::default(),
            predictor: PredictorConfig::default(),
            recommend: RecommendConfig::default(),
            batch: BatchConfig::default(),
            cohort: CohortConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read engine config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad engine config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject values that would make the engine misbehave rather than fail.
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, what: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::Config(what.to_string()))
            }
        }
        let unit = |v: f64| (0.0..=1.0).contains(&v);

        check(self.timeout_ms > 0, "timeout_ms must be positive")?;
        check(
            self.breaker.failure_threshold > 0,
            "breaker.failure_threshold must be positive",
        )?;
        check(
            self.breaker.half_open_trials > 0,
            "breaker.half_open_trials must be positive",
        )?;
        check(
            self.retry.base_delay_ms <= self.retry.max_delay_ms,
            "retry.base_delay_ms must not exceed retry.max_delay_ms",
        )?;
        check(
            self.ingest.history_capacity > 0,
            "ingest.history_capacity must be positive",
        )?;
        check(
            self.ingest.max_cas_attempts > 0,
            "ingest.max_cas_attempts must be positive",
        )?;
        check(
            self.predictor.min_history >= 2,
            "predictor.min_history must be at least 2",
        )?;
        check(
            self.predictor.outlier_sd > 0.0,
            "predictor.outlier_sd must be positive",
        )?;
        check(
            unit(self.predictor.intervention_threshold),
            "predictor.intervention_threshold must be in [0, 1]",
        )?;
        check(
            unit(self.recommend.threshold),
            "recommend.threshold must be in [0, 1]",
        )?;
        check(
            self.recommend.medium_gap <= self.recommend.high_gap,
            "recommend.medium_gap must not exceed recommend.high_gap",
        )?;
        check(self.batch.workers > 0, "batch.workers must be positive")?;
        check(
            self.cohort.alpha > 0.0 && self.cohort.alpha < 1.0,
            "cohort.alpha must be in (0, 1)",
        )?;
        check(
            self.cohort.min_group_size >= 2,
            "cohort.min_group_size must be at least 2",
        )
    }
}

/// Circuit breaker thresholds, one breaker per guarded dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures (within `failure_window_ms`) that open the circuit.
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    /// Time spent open before trial calls are let through.
    pub cooldown_ms: u64,
    /// Trial calls that must all succeed to close again.
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            cooldown_ms: 30_000,
            half_open_trials: 3,
        }
    }
}

impl BreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Snapshots kept per record; oldest are evicted.
    pub history_capacity: usize,
    /// Recently applied idempotency keys remembered per record.
    pub dedupe_window: usize,
    /// Read-modify-CAS rounds before giving up on a contended key.
    pub max_cas_attempts: u32,
    /// Dead-letter attempts before an event needs manual review.
    pub max_dead_letter_attempts: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            history_capacity: 90,
            dedupe_window: 64,
            max_cas_attempts: 3,
            max_dead_letter_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub min_history: usize,
    /// Residuals further than this many standard deviations from the first
    /// fit are dropped before the single refit.
    pub outlier_sd: f64,
    pub intervention_threshold: f64,
    pub max_horizon_days: u32,
    pub cache_ttl_secs: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            min_history: 3,
            outlier_sd: 2.0,
            intervention_threshold: 0.5,
            max_horizon_days: 365,
            cache_ttl_secs: 3_600,
        }
    }
}

impl PredictorConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendConfig {
    /// Sub-scores below this produce a recommendation.
    pub threshold: f64,
    pub high_gap: f64,
    pub medium_gap: f64,
    /// Mastery at or above this with no gaps suggests moving on.
    /// `None` disables the LEARN_NEW suggestion.
    pub advance_threshold: Option<f64>,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            high_gap: 0.3,
            medium_gap: 0.15,
            advance_threshold: Some(0.9),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Jobs processed concurrently.
    pub workers: usize,
    /// Prediction horizon used for batch re-evaluation.
    pub horizon_days: u32,
    /// How long a finished job (and its results) stays queryable.
    pub retention_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            horizon_days: 14,
            retention_secs: 3_600,
        }
    }
}

impl BatchConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortConfig {
    pub min_group_size: usize,
    pub alpha: f64,
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            min_group_size: 5,
            alpha: 0.05,
        }
    }
}
