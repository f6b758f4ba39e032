//! Event bus over pgmq queues.
//!
//! `learning_events` feeds ingestion, `mastery_updated` receives
//! `MasteryUpdated`, `mastery_dead_letter` parks events awaiting redrive and
//! `mastery_manual_review` holds the ones that exhausted their retries.
//! Acknowledging a message archives it.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::{Db, queues};
use crate::bus::{DeadLetter, DeadLetterSink, Delivery, EventSink, EventSource, ParkedLetter};
use crate::error::Result;
use crate::model::{LearningEvent, MasteryUpdated};

pub struct PgmqBus {
    db: Arc<Db>,
    /// Seconds a read message stays hidden before it is redelivered.
    visibility_timeout: i32,
}

impl PgmqBus {
    pub fn new(db: Arc<Db>, visibility_timeout: i32) -> Self {
        Self {
            db,
            visibility_timeout,
        }
    }

    /// Enqueue a learning event for ingestion.
    pub async fn send_event(&self, event: &LearningEvent) -> Result<i64> {
        self.db
            .send_to_queue(queues::LEARNING_EVENTS, &serde_json::to_value(event)?)
            .await
    }

    fn batch_size(max: usize) -> i32 {
        i32::try_from(max).unwrap_or(i32::MAX).max(1)
    }
}

#[async_trait]
impl EventSource for PgmqBus {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let messages = self
            .db
            .read_from_queue(
                queues::LEARNING_EVENTS,
                self.visibility_timeout,
                Self::batch_size(max),
            )
            .await?;
        Ok(messages
            .into_iter()
            .map(|m| Delivery {
                id: m.msg_id,
                read_count: m.read_ct,
                payload: m.message,
            })
            .collect())
    }

    async fn ack(&self, delivery_id: i64) -> Result<()> {
        self.db
            .archive_message(queues::LEARNING_EVENTS, delivery_id)
            .await
    }
}

#[async_trait]
impl EventSink for PgmqBus {
    async fn publish(&self, event: &MasteryUpdated) -> Result<()> {
        self.db
            .send_to_queue(queues::MASTERY_UPDATED, &serde_json::to_value(event)?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for PgmqBus {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        self.db
            .send_to_queue(queues::DEAD_LETTER, &serde_json::to_value(letter)?)
            .await?;
        Ok(())
    }

    async fn quarantine(&self, letter: &DeadLetter) -> Result<()> {
        self.db
            .send_to_queue(queues::MANUAL_REVIEW, &serde_json::to_value(letter)?)
            .await?;
        Ok(())
    }

    async fn take_dead_letters(&self, max: usize) -> Result<Vec<ParkedLetter>> {
        let messages = self
            .db
            .read_from_queue(
                queues::DEAD_LETTER,
                self.visibility_timeout,
                Self::batch_size(max),
            )
            .await?;

        let mut parked = Vec::with_capacity(messages.len());
        for m in messages {
            match serde_json::from_value::<DeadLetter>(m.message.clone()) {
                Ok(letter) => parked.push(ParkedLetter {
                    id: m.msg_id,
                    letter,
                }),
                Err(e) => {
                    // Not a dead letter we wrote; hand it to a human as-is.
                    warn!(msg_id = m.msg_id, error = %e, "undecodable dead letter, moving to manual review");
                    self.db
                        .send_to_queue(queues::MANUAL_REVIEW, &m.message)
                        .await?;
                    self.db.archive_message(queues::DEAD_LETTER, m.msg_id).await?;
                }
            }
        }
        Ok(parked)
    }

    async fn release(&self, id: i64) -> Result<()> {
        self.db.archive_message(queues::DEAD_LETTER, id).await
    }
}
