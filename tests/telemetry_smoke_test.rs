//! End-to-end checks that the engine's own signals reach the observability
//! stack: ingest and batch spans in Tempo, `mastery_*` series in Prometheus,
//! breaker log records in Loki.
//!
//! Needs an OTLP collector on :4317 feeding Tempo (:3200), Prometheus (:9090)
//! and Loki (:3100). Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;

use mastery_engine::analytics::{BatchScheduler, MasteryEvaluator};
use mastery_engine::bus::MemoryBus;
use mastery_engine::config::{BreakerConfig, EngineConfig};
use mastery_engine::error::{Error, Result};
use mastery_engine::ingest::Ingestor;
use mastery_engine::model::{BatchPriority, BatchStatus, LearningEvent, SubScores};
use mastery_engine::predict::Predictor;
use mastery_engine::resilience::{CircuitBreaker, CircuitState, Dependencies, Guarded, RetryPolicy};
use mastery_engine::store::{MasteryStore, MemoryStateStore};
use mastery_engine::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};

const SERVICE: &str = "mastery-smoke-test";

/// One runtime for every test so the exporters' gRPC channels outlive any
/// single test body.
fn runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| tokio::runtime::Runtime::new().expect("runtime"))
}

fn telemetry() -> &'static TelemetryGuard {
    static GUARD: OnceLock<TelemetryGuard> = OnceLock::new();
    GUARD.get_or_init(|| {
        runtime().block_on(async {
            init_telemetry(TelemetryConfig {
                endpoint: Some("http://localhost:4317".to_string()),
                service_name: SERVICE.to_string(),
                log_level: "info".to_string(),
                environment: Some("smoke".to_string()),
                metric_interval: Duration::from_secs(1),
            })
            .expect("telemetry init")
        })
    })
}

async fn flush(guard: &TelemetryGuard) {
    guard.force_flush().expect("flush");
    tokio::time::sleep(Duration::from_secs(8)).await;
}

fn event(student: &str, key: &str, days_ago: i64, score: f64) -> LearningEvent {
    LearningEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        student_id: student.to_string(),
        component: "loops".to_string(),
        scores: SubScores::new(score, score, score, score),
        occurred_at: Utc::now() - chrono::Duration::days(days_ago),
        idempotency_key: key.to_string(),
        correction: false,
    }
}

/// A unique student id so repeated runs don't match each other's data.
fn student() -> String {
    format!("smoke-{}", uuid::Uuid::new_v4().simple())
}

struct Engine {
    ingestor: Ingestor,
    scheduler: BatchScheduler,
}

fn engine() -> Engine {
    let config = EngineConfig::default();
    let deps = Dependencies::from_config(&config);
    let bus = Arc::new(MemoryBus::new());
    let store = MasteryStore::new(Arc::new(MemoryStateStore::new()), deps.store.clone());
    let ingestor = Ingestor::new(
        store.clone(),
        bus.clone(),
        bus,
        deps.bus.clone(),
        config.ingest.clone(),
    );
    let evaluator = MasteryEvaluator::new(
        store,
        Arc::new(Predictor::new(config.predictor.clone())),
        config.recommend.clone(),
    );
    Engine {
        ingestor,
        scheduler: BatchScheduler::new(Arc::new(evaluator), config.batch.clone()),
    }
}

/// Trip a single-failure breaker named `dependency`.
async fn trip_breaker(dependency: &str) {
    let guard = Guarded::new(
        Arc::new(CircuitBreaker::new(
            dependency,
            BreakerConfig {
                failure_threshold: 1,
                failure_window_ms: 60_000,
                cooldown_ms: 60_000,
                half_open_trials: 1,
            },
        )),
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        Duration::from_secs(1),
    );
    let result: Result<()> = guard
        .call("smoke", || async { Err(Error::transient("connection refused")) })
        .await;
    assert!(result.is_err());
    assert_eq!(guard.breaker().state(), CircuitState::Open);
}

// ---------------------------------------------------------------------------
// Backend queries
// ---------------------------------------------------------------------------

struct Backends {
    client: reqwest::Client,
}

impl Backends {
    fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> serde_json::Value {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .unwrap_or_else(|e| panic!("GET {url}: {e}"));
        assert!(resp.status().is_success(), "GET {url}: {}", resp.status());
        resp.json().await.expect("json body")
    }

    /// Traces matching a TraceQL query.
    async fn traces(&self, traceql: &str) -> usize {
        let body = self
            .get(
                "http://localhost:3200/api/search",
                &[("q", traceql), ("limit", "20")],
            )
            .await;
        body["traces"].as_array().map_or(0, Vec::len)
    }

    /// Series returned by an instant PromQL query.
    async fn series(&self, promql: &str) -> usize {
        let body = self
            .get("http://localhost:9090/api/v1/query", &[("query", promql)])
            .await;
        body["data"]["result"].as_array().map_or(0, Vec::len)
    }

    /// Streams returned by a LogQL range query.
    async fn log_streams(&self, logql: &str) -> usize {
        let body = self
            .get(
                "http://localhost:3100/loki/api/v1/query_range",
                &[("query", logql), ("limit", "20")],
            )
            .await;
        body["data"]["result"].as_array().map_or(0, Vec::len)
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn ingest_spans_carry_student_and_disposition() {
    let guard = telemetry();
    runtime().block_on(async {
        let engine = engine();
        let student = student();
        let first = event(&student, "k1", 0, 0.7);
        engine.ingestor.ingest(&first).await.expect("ingest");
        engine.ingestor.ingest(&first).await.expect("redelivery");

        flush(guard).await;

        let backends = Backends::new();
        let applied = format!(
            r#"{{ resource.service.name = "{SERVICE}" && name = "mastery.ingest" && span.student.id = "{student}" && span.ingest.disposition = "applied" }}"#
        );
        let duplicate = applied.replace("applied", "duplicate");
        assert_eq!(backends.traces(&applied).await, 1, "{applied}");
        assert_eq!(backends.traces(&duplicate).await, 1, "{duplicate}");
    });
}

#[test]
#[ignore]
fn breaker_transitions_reach_prometheus_and_loki() {
    let guard = telemetry();
    runtime().block_on(async {
        let dependency = format!("smoke_store_{}", uuid::Uuid::new_v4().simple());
        trip_breaker(&dependency).await;

        flush(guard).await;

        let backends = Backends::new();
        let transitions = format!(
            r#"mastery_breaker_transitions_total{{dependency="{dependency}",from="closed",to="open"}}"#
        );
        assert_eq!(backends.series(&transitions).await, 1, "{transitions}");

        let opened = format!(r#"{{service_name="{SERVICE}"}} |= "circuit opened""#);
        assert!(backends.log_streams(&opened).await > 0, "{opened}");
    });
}

#[test]
#[ignore]
fn batch_run_is_traced_and_counted() {
    let guard = telemetry();
    runtime().block_on(async {
        let engine = engine();
        let student = student();
        for (i, score) in [0.5, 0.55, 0.6, 0.65].into_iter().enumerate() {
            let e = event(&student, &format!("b{i}"), 4 - i as i64, score);
            engine.ingestor.ingest(&e).await.expect("ingest");
        }
        let batch_id = engine
            .scheduler
            .submit([student.as_str()], BatchPriority::High)
            .expect("submit");
        engine.scheduler.run_until_idle().await.expect("batch");
        assert_eq!(
            engine.scheduler.status(&batch_id).unwrap().status,
            BatchStatus::Completed
        );

        flush(guard).await;

        let backends = Backends::new();
        let span = format!(
            r#"{{ resource.service.name = "{SERVICE}" && name = "mastery.batch" && span.batch.id = "{batch_id}" && span.batch.status = "COMPLETED" }}"#
        );
        assert_eq!(backends.traces(&span).await, 1, "{span}");
        assert!(
            backends
                .series(r#"mastery_batch_students_total{priority="HIGH",result="ok"}"#)
                .await
                > 0
        );
        assert!(
            backends
                .series(r#"mastery_events_ingested_total{result="applied"}"#)
                .await
                > 0
        );
    });
}
