//! Event ingestion pipeline: the only writer of mastery records.
//!
//! For each learning event: validate, load the record, drop redeliveries and
//! strictly-older events, fold the event in, CAS the record back, publish
//! `MasteryUpdated`. A lost CAS re-reads and tries again; a store that can't
//! be reached sends the event down the dead-letter path.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, info, warn};

use crate::bus::{DeadLetter, DeadLetterSink, EventSink};
use crate::config::IngestConfig;
use crate::error::{Error, Result};
use crate::model::{LearningEvent, MasteryRecord};
use crate::resilience::Guarded;
use crate::store::MasteryStore;
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_disposition, start_ingest_span};

/// What ingestion did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Folded into the record and persisted.
    Applied,
    /// Idempotency key already applied; nothing changed.
    Duplicate,
    /// Older than the record and not a correction; nothing changed.
    Stale,
    /// A redriven event older than the record: added to history at its own
    /// timestamp, current view untouched.
    Backfilled,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Applied => "applied",
            Disposition::Duplicate => "duplicate",
            Disposition::Stale => "stale",
            Disposition::Backfilled => "backfilled",
        }
    }
}

/// How an event reached the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    Live,
    Redriven,
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub record: MasteryRecord,
    pub disposition: Disposition,
}

pub struct Ingestor {
    store: MasteryStore,
    sink: Arc<dyn EventSink>,
    dead_letters: Arc<dyn DeadLetterSink>,
    bus: Guarded,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        store: MasteryStore,
        sink: Arc<dyn EventSink>,
        dead_letters: Arc<dyn DeadLetterSink>,
        bus: Guarded,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            sink,
            dead_letters,
            bus,
            config,
        }
    }

    /// Apply one learning event.
    ///
    /// Redeliveries and stale events return the current record unchanged.
    /// If the state store can't be reached the event is dead-lettered and
    /// `Error::DeadLettered` is returned.
    pub async fn ingest(&self, event: &LearningEvent) -> Result<Ingested> {
        let span = start_ingest_span(event);
        async {
            let start = Instant::now();
            let result = self.ingest_or_dead_letter(event, None, Arrival::Live).await;
            let label = match &result {
                Ok(ingested) => ingested.disposition.as_str(),
                Err(Error::Validation(_)) => "invalid",
                Err(Error::DeadLettered { .. }) => "dead_lettered",
                Err(_) => "error",
            };
            record_disposition(&span, label);
            metrics::events_ingested().add(1, &[KeyValue::new("result", label)]);
            metrics::operation_duration_ms().record(
                start.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "ingest")],
            );
            result
        }
        .instrument(span.clone())
        .await
    }

    /// Re-attempt a dead-lettered event. Events applied for the same key
    /// while it was parked don't make it stale: it is backfilled into
    /// history instead. Another store failure re-parks it with a bumped
    /// attempt count; past the cap it is quarantined and
    /// `Error::PermanentFailure` is returned.
    pub async fn redrive(&self, letter: DeadLetter) -> Result<Ingested> {
        let event = letter.event.clone();
        let span = start_ingest_span(&event);
        async {
            let result = self
                .ingest_or_dead_letter(&event, Some(letter), Arrival::Redriven)
                .await;
            if let Ok(ref ingested) = result {
                record_disposition(&span, ingested.disposition.as_str());
                metrics::dead_letters().add(1, &redriven_labels(ingested.disposition));
            }
            result
        }
        .instrument(span.clone())
        .await
    }

    async fn ingest_or_dead_letter(
        &self,
        event: &LearningEvent,
        previous: Option<DeadLetter>,
        arrival: Arrival,
    ) -> Result<Ingested> {
        event.validate()?;

        match self.apply(event, arrival).await {
            Ok(ingested) => {
                if ingested.disposition == Disposition::Applied {
                    self.publish(&ingested.record).await;
                }
                Ok(ingested)
            }
            Err(e) => {
                let reason = e.to_string();
                let letter = match previous {
                    None => DeadLetter::new(event.clone(), reason),
                    Some(letter) => letter.failed_again(reason),
                };
                Err(self.park(letter).await)
            }
        }
    }

    /// Load, decide, fold, CAS. Retries lost CAS races with a fresh read.
    async fn apply(&self, event: &LearningEvent, arrival: Arrival) -> Result<Ingested> {
        for attempt in 1..=self.config.max_cas_attempts {
            let current = self.store.load(&event.student_id, &event.component).await?;

            let mut disposition = Disposition::Applied;
            let (mut record, expected) = match current {
                Some(v) => {
                    if v.value.has_applied(&event.idempotency_key) {
                        debug!("idempotency key already applied");
                        return Ok(Ingested {
                            record: v.value,
                            disposition: Disposition::Duplicate,
                        });
                    }
                    if v.value.is_stale(event) {
                        if arrival == Arrival::Live {
                            info!(
                                occurred_at = %event.occurred_at,
                                updated_at = %v.value.updated_at,
                                "discarding out-of-order event"
                            );
                            return Ok(Ingested {
                                record: v.value,
                                disposition: Disposition::Stale,
                            });
                        }
                        info!(
                            occurred_at = %event.occurred_at,
                            updated_at = %v.value.updated_at,
                            "redriven event predates the record, backfilling history"
                        );
                        disposition = Disposition::Backfilled;
                    }
                    (v.value, Some(v.version))
                }
                None => (
                    MasteryRecord::new(
                        &event.student_id,
                        &event.component,
                        self.config.history_capacity,
                    ),
                    None,
                ),
            };

            match disposition {
                Disposition::Backfilled => record.backfill(event, self.config.dedupe_window),
                _ => record.apply(event, self.config.dedupe_window),
            }

            match self.store.save(&record, expected).await {
                Ok(version) => {
                    debug!(version, mastery = record.mastery, "record persisted");
                    return Ok(Ingested {
                        record,
                        disposition,
                    });
                }
                Err(Error::ConcurrentModification { .. }) => {
                    debug!(attempt, "lost CAS race, re-reading");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::DependencyUnavailable {
            dependency: self.store.guard().dependency().to_string(),
            retry_after: std::time::Duration::from_millis(100),
        })
    }

    /// The record is already durable; a failed publish is logged, not undone.
    async fn publish(&self, record: &MasteryRecord) {
        let summary = record.summary();
        if let Err(e) = self
            .bus
            .call("publish", || self.sink.publish(&summary))
            .await
        {
            error!(error = %e, "failed to publish MasteryUpdated");
        }
    }

    /// Dead-letter or quarantine, returning the error to surface.
    async fn park(&self, letter: DeadLetter) -> Error {
        let event_id = letter.event.event_id.clone();
        let attempts = letter.attempts;
        let reason = letter.reason.clone();

        if attempts > self.config.max_dead_letter_attempts {
            error!(attempts, %reason, "retry cap exceeded, quarantining event");
            if let Err(e) = self
                .bus
                .call("quarantine", || self.dead_letters.quarantine(&letter))
                .await
            {
                return e;
            }
            metrics::dead_letters().add(1, &[KeyValue::new("outcome", "permanent")]);
            return Error::PermanentFailure {
                event_id,
                attempts,
                reason,
            };
        }

        warn!(attempts, %reason, "state store write failed, dead-lettering event");
        if let Err(e) = self
            .bus
            .call("dead_letter", || self.dead_letters.dead_letter(&letter))
            .await
        {
            return e;
        }
        metrics::dead_letters().add(1, &[KeyValue::new("outcome", "queued")]);
        Error::DeadLettered {
            event_id,
            attempts,
            reason,
        }
    }
}

fn redriven_labels(disposition: Disposition) -> [KeyValue; 2] {
    [
        KeyValue::new("outcome", "redriven"),
        KeyValue::new("disposition", disposition.as_str()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redrive_metric_is_labelled_by_disposition() {
        for (disposition, label) in [
            (Disposition::Applied, "applied"),
            (Disposition::Duplicate, "duplicate"),
            (Disposition::Backfilled, "backfilled"),
        ] {
            let [outcome, by] = redriven_labels(disposition);
            assert_eq!(outcome, KeyValue::new("outcome", "redriven"));
            assert_eq!(by, KeyValue::new("disposition", label));
        }
    }
}
