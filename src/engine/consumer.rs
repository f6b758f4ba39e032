//! Consumer loop: pulls learning events off the event source, ingests them
//! in delivery order, and retires each delivery.
//!
//! A delivery is acknowledged once its outcome is settled: applied,
//! duplicate, stale, invalid, dead-lettered, or quarantined. Anything else
//! (the dead-letter path itself unreachable) is left unacknowledged and
//! comes back after the transport's visibility timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::bus::{DeadLetterSink, Delivery, EventSource};
use crate::error::{Error, Result};
use crate::ingest::{Disposition, Ingested, Ingestor};
use crate::resilience::Guarded;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Deliveries requested per receive.
    pub batch_size: usize,
    /// Wait between polls of an empty source.
    pub poll_interval: Duration,
    /// How often parked dead letters are redriven; `None` disables it.
    pub redrive_interval: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            poll_interval: Duration::from_secs(1),
            redrive_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Counts from one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub received: usize,
    pub acked: usize,
    /// Left for redelivery.
    pub retained: usize,
}

/// Counts from one redrive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedriveSummary {
    pub taken: usize,
    /// Applied, or found already applied.
    pub recovered: usize,
    /// Overtaken by newer events while parked; added to history only.
    pub backfilled: usize,
    pub parked_again: usize,
    pub quarantined: usize,
}

pub struct Consumer {
    source: Arc<dyn EventSource>,
    dead_letters: Arc<dyn DeadLetterSink>,
    ingestor: Arc<Ingestor>,
    bus: Guarded,
    config: ConsumerConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl Clone for Consumer {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            dead_letters: Arc::clone(&self.dead_letters),
            ingestor: Arc::clone(&self.ingestor),
            bus: self.bus.clone(),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
        }
    }
}

enum Verdict {
    Ack(&'static str),
    Retain,
}

fn verdict(result: &Result<Ingested>) -> Verdict {
    match result {
        Ok(ingested) => Verdict::Ack(ingested.disposition.as_str()),
        Err(Error::Validation(_)) => Verdict::Ack("invalid"),
        Err(Error::DeadLettered { .. }) => Verdict::Ack("dead_lettered"),
        Err(Error::PermanentFailure { .. }) => Verdict::Ack("quarantined"),
        Err(_) => Verdict::Retain,
    }
}

impl Consumer {
    pub fn new(
        source: Arc<dyn EventSource>,
        dead_letters: Arc<dyn DeadLetterSink>,
        ingestor: Arc<Ingestor>,
        bus: Guarded,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            dead_letters,
            ingestor,
            bus,
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal the consumer loop to stop after the current poll, backlog or
    /// not.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Consume until [`Consumer::shutdown`].
    pub async fn run(&self) -> Result<()> {
        info!(batch_size = self.config.batch_size, "consumer started");
        let mut last_redrive = tokio::time::Instant::now();

        while !self.stopping.load(Ordering::SeqCst) {
            let full = match self.poll_once().await {
                Ok(summary) => summary.received >= self.config.batch_size,
                Err(e) => {
                    warn!(code = e.code(), "poll failed: {e}");
                    false
                }
            };

            if let Some(every) = self.config.redrive_interval {
                if last_redrive.elapsed() >= every {
                    last_redrive = tokio::time::Instant::now();
                    if let Err(e) = self.redrive(self.config.batch_size).await {
                        warn!(code = e.code(), "redrive failed: {e}");
                    }
                }
            }

            // A full batch means more is probably waiting.
            if full {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!("consumer shutting down");
        Ok(())
    }

    /// Receive one batch and ingest it in delivery order.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let max = self.config.batch_size;
        let deliveries = self
            .bus
            .call("receive", || self.source.receive(max))
            .await?;

        let mut summary = PollSummary {
            received: deliveries.len(),
            ..PollSummary::default()
        };
        for delivery in deliveries {
            if self.handle(&delivery).await {
                summary.acked += 1;
            } else {
                summary.retained += 1;
            }
        }
        if summary.received > 0 {
            debug!(?summary, "poll complete");
        }
        Ok(summary)
    }

    /// Returns whether the delivery was acknowledged.
    async fn handle(&self, delivery: &Delivery) -> bool {
        let event = match delivery.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    delivery_id = delivery.id,
                    read_count = delivery.read_count,
                    error = %e,
                    "undecodable message, archiving"
                );
                return self.ack(delivery.id, "poison").await;
            }
        };

        let result = self.ingestor.ingest(&event).await;
        match verdict(&result) {
            Verdict::Ack(outcome) => self.ack(delivery.id, outcome).await,
            Verdict::Retain => {
                if let Err(e) = &result {
                    error!(
                        delivery_id = delivery.id,
                        event_id = %event.event_id,
                        code = e.code(),
                        error = %e,
                        "event left for redelivery"
                    );
                }
                false
            }
        }
    }

    async fn ack(&self, delivery_id: i64, outcome: &'static str) -> bool {
        match self
            .bus
            .call("ack", || self.source.ack(delivery_id))
            .await
        {
            Ok(()) => {
                debug!(delivery_id, outcome, "delivery acknowledged");
                true
            }
            Err(e) => {
                // Redelivery will be absorbed by idempotency.
                warn!(delivery_id, outcome, error = %e, "ack failed");
                false
            }
        }
    }

    /// Re-attempt up to `max` parked dead letters.
    pub async fn redrive(&self, max: usize) -> Result<RedriveSummary> {
        let parked = self
            .bus
            .call("take_dead_letters", || self.dead_letters.take_dead_letters(max))
            .await?;

        let mut summary = RedriveSummary {
            taken: parked.len(),
            ..RedriveSummary::default()
        };
        for item in parked {
            let outcome = self.ingestor.redrive(item.letter).await;
            let settled = match &outcome {
                Ok(ingested) if ingested.disposition == Disposition::Backfilled => {
                    summary.backfilled += 1;
                    true
                }
                Ok(_) => {
                    summary.recovered += 1;
                    true
                }
                Err(Error::DeadLettered { .. }) => {
                    summary.parked_again += 1;
                    true
                }
                Err(Error::PermanentFailure { .. }) => {
                    summary.quarantined += 1;
                    true
                }
                Err(e) => {
                    warn!(id = item.id, code = e.code(), "dead letter left for next redrive");
                    false
                }
            };
            if settled {
                self.bus
                    .call("release", || self.dead_letters.release(item.id))
                    .await?;
            }
        }
        if summary.taken > 0 {
            info!(?summary, "redrive pass complete");
        }
        Ok(summary)
    }
}
