//! Span helpers for ingestion and batch work.

use tracing::Span;

use crate::model::{BatchId, LearningEvent};

/// Start a span covering one event's trip through ingestion.
///
/// `ingest.disposition` is declared empty and filled in via
/// [`record_disposition`] once the outcome is known.
pub fn start_ingest_span(event: &LearningEvent) -> Span {
    tracing::info_span!(
        "mastery.ingest",
        "student.id" = %event.student_id,
        "mastery.component" = %event.component,
        "event.id" = %event.event_id,
        "event.idempotency_key" = %event.idempotency_key,
        "ingest.disposition" = tracing::field::Empty,
    )
}

pub fn record_disposition(span: &Span, disposition: &str) {
    span.record("ingest.disposition", disposition);
}

/// Start a span for a batch job run.
pub fn start_batch_span(batch_id: &BatchId, priority: &str, students: usize) -> Span {
    tracing::info_span!(
        "mastery.batch",
        "batch.id" = %batch_id,
        "batch.priority" = priority,
        "batch.students" = students,
        "batch.status" = tracing::field::Empty,
    )
}

/// Record a status transition event on the given span.
///
/// Emits a tracing `info` event scoped to the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("batch.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
