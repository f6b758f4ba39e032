//! Metric instrument factories for mastery-engine.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"mastery-engine"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for mastery-engine instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("mastery-engine")
}

/// Counter: learning events seen by the ingestion pipeline.
/// Labels: `result` ("applied" | "duplicate" | "stale" | "invalid" | "dead_lettered" | "error").
pub fn events_ingested() -> Counter<u64> {
    meter()
        .u64_counter("mastery.events.ingested")
        .with_description("Number of learning events processed by ingestion")
        .build()
}

/// Counter: circuit breaker state transitions.
/// Labels: `dependency`, `from`, `to`.
pub fn breaker_transitions() -> Counter<u64> {
    meter()
        .u64_counter("mastery.breaker.transitions")
        .with_description("Number of circuit breaker state transitions")
        .build()
}

/// Counter: calls rejected by an open (or saturated half-open) breaker.
/// Labels: `dependency`.
pub fn breaker_rejections() -> Counter<u64> {
    meter()
        .u64_counter("mastery.breaker.rejections")
        .with_description("Calls failed fast by a circuit breaker")
        .build()
}

/// Counter: retried dependency call attempts.
/// Labels: `dependency`, `operation`.
pub fn dependency_retries() -> Counter<u64> {
    meter()
        .u64_counter("mastery.dependency.retries")
        .with_description("Number of retried dependency call attempts")
        .build()
}

/// Counter: dead-letter routing.
/// Labels: `outcome` ("queued" | "redriven" | "permanent"); redrives also carry
/// `disposition` ("applied" | "duplicate" | "backfilled").
pub fn dead_letters() -> Counter<u64> {
    meter()
        .u64_counter("mastery.dead_letters")
        .with_description("Learning events routed through the dead-letter path")
        .build()
}

/// Counter: prediction requests.
/// Labels: `cache` ("hit" | "miss"), `result` ("ok" | "insufficient_history" | "error").
pub fn predictions() -> Counter<u64> {
    meter()
        .u64_counter("mastery.predictions")
        .with_description("Number of prediction requests")
        .build()
}

/// Counter: students evaluated by batch jobs.
/// Labels: `priority`, `result` ("ok" | "error").
pub fn batch_students() -> Counter<u64> {
    meter()
        .u64_counter("mastery.batch.students")
        .with_description("Students evaluated by batch jobs")
        .build()
}

/// Counter: queue-level operations (send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("mastery.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Ingests land in single-digit ms; batch jobs run into seconds.
const DURATION_BUCKETS_MS: [f64; 12] = [
    1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0,
];

/// Histogram: operation duration in milliseconds.
/// Labels: `operation` ("ingest" | "batch").
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("mastery.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .with_boundaries(DURATION_BUCKETS_MS.to_vec())
        .build()
}
