//! Shared wiring for integration tests: the engine assembled over the
//! in-memory state store and bus.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use mastery_engine::analytics::{BatchScheduler, MasteryEvaluator};
use mastery_engine::bus::{DeadLetter, DeadLetterSink, MemoryBus, ParkedLetter};
use mastery_engine::config::EngineConfig;
use mastery_engine::engine::{Consumer, ConsumerConfig};
use mastery_engine::error::{Error, Result};
use mastery_engine::ingest::Ingestor;
use mastery_engine::model::{LearningEvent, SubScores};
use mastery_engine::predict::Predictor;
use mastery_engine::resilience::Dependencies;
use mastery_engine::service::MasteryService;
use mastery_engine::store::{MasteryStore, MemoryStateStore, StateStore, Versioned};

/// Engine config tuned for tests: no backoff sleeps, short cooldown.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.max_retries = 0;
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config.breaker.cooldown_ms = 50;
    config.timeout_ms = 500;
    config
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap()
}

pub fn day(n: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::days(n)
}

pub fn event(
    student: &str,
    component: &str,
    key: &str,
    at: DateTime<Utc>,
    scores: SubScores,
) -> LearningEvent {
    LearningEvent {
        event_id: format!("evt-{key}"),
        student_id: student.to_string(),
        component: component.to_string(),
        scores,
        occurred_at: at,
        idempotency_key: key.to_string(),
        correction: false,
    }
}

pub fn flat(score: f64) -> SubScores {
    SubScores::new(score, score, score, score)
}

/// A state store that can be switched into failure mode.
pub struct FlakyStore {
    inner: MemoryStateStore,
    failing: AtomicBool,
    pub calls: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStateStore::new(),
            failing: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::transient("connection reset"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<u64> {
        self.check()?;
        self.inner.put_if_version(key, value, expected).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        self.inner.keys_with_prefix(prefix).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.check()?;
        self.inner.purge_expired().await
    }
}

/// A dead-letter sink that can't be reached.
pub struct UnreachableDeadLetters;

#[async_trait]
impl DeadLetterSink for UnreachableDeadLetters {
    async fn dead_letter(&self, _letter: &DeadLetter) -> Result<()> {
        Err(Error::fatal("dead-letter queue unreachable"))
    }

    async fn quarantine(&self, _letter: &DeadLetter) -> Result<()> {
        Err(Error::fatal("manual-review queue unreachable"))
    }

    async fn take_dead_letters(&self, _max: usize) -> Result<Vec<ParkedLetter>> {
        Ok(Vec::new())
    }

    async fn release(&self, _id: i64) -> Result<()> {
        Ok(())
    }
}

/// The whole engine over in-memory backends.
pub struct Harness {
    pub config: Arc<EngineConfig>,
    pub backend: Arc<FlakyStore>,
    pub bus: Arc<MemoryBus>,
    pub deps: Dependencies,
    pub store: MasteryStore,
    pub ingestor: Arc<Ingestor>,
    pub predictor: Arc<Predictor>,
    pub service: MasteryService,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_dead_letters(config, None)
    }

    pub fn with_dead_letters(
        config: EngineConfig,
        dead_letters: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        let config = Arc::new(config);
        let backend = Arc::new(FlakyStore::new());
        let bus = Arc::new(MemoryBus::new());
        let deps = Dependencies::from_config(&config);
        let store = MasteryStore::new(backend.clone(), deps.store.clone());
        let dead_letters = dead_letters.unwrap_or_else(|| bus.clone() as Arc<dyn DeadLetterSink>);
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            bus.clone(),
            dead_letters,
            deps.bus.clone(),
            config.ingest.clone(),
        ));
        let predictor = Arc::new(Predictor::new(config.predictor.clone()));
        let scheduler = BatchScheduler::new(
            Arc::new(MasteryEvaluator::new(
                store.clone(),
                predictor.clone(),
                config.recommend.clone(),
            )),
            config.batch.clone(),
        );
        let service =
            MasteryService::new(store.clone(), predictor.clone(), scheduler, config.clone());

        Self {
            config,
            backend,
            bus,
            deps,
            store,
            ingestor,
            predictor,
            service,
        }
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            self.bus.clone(),
            self.bus.clone(),
            self.ingestor.clone(),
            self.deps.bus.clone(),
            ConsumerConfig {
                batch_size: 16,
                poll_interval: Duration::from_millis(10),
                redrive_interval: None,
            },
        )
    }

    /// One daily event per score, starting at `t0`.
    pub async fn seed(&self, student: &str, component: &str, scores: &[f64]) {
        for (i, &score) in scores.iter().enumerate() {
            let key = format!("{student}-{component}-{i}");
            self.ingestor
                .ingest(&event(student, component, &key, day(i as i64), flat(score)))
                .await
                .unwrap();
        }
    }
}
