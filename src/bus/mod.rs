//! Event bus contracts: where learning events come from, where
//! `MasteryUpdated` goes, and where undeliverable events are parked.
//!
//! Only the consumer side lives here; the transport is someone else's
//! problem. Postgres/pgmq implementations are in `crate::db::pgmq`.

pub mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{LearningEvent, MasteryUpdated};

/// One message handed out by an event source.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Transport id used to acknowledge the message.
    pub id: i64,
    /// How many times the transport has handed this message out.
    pub read_count: i32,
    pub payload: serde_json::Value,
}

impl Delivery {
    pub fn decode(&self) -> Result<LearningEvent> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// At-least-once stream of learning events, partitioned by student.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Up to `max` messages, oldest first. Empty when nothing is waiting.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>>;

    /// Done with this message; don't hand it out again.
    async fn ack(&self, delivery_id: i64) -> Result<()>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &MasteryUpdated) -> Result<()>;
}

/// An event whose state-store write could not be completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event: LearningEvent,
    pub reason: String,
    /// Failed processing attempts so far, starting at 1.
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(event: LearningEvent, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            event,
            reason: reason.into(),
            attempts: 1,
            first_failed_at: now,
            last_failed_at: now,
        }
    }

    /// Another failed attempt.
    pub fn failed_again(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self.attempts += 1;
        self.last_failed_at = Utc::now();
        self
    }
}

/// A dead letter as handed back for redrive.
#[derive(Debug, Clone)]
pub struct ParkedLetter {
    pub id: i64,
    pub letter: DeadLetter,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Park an event for a later redrive.
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()>;

    /// Give up on an event; a human has to look at it.
    async fn quarantine(&self, letter: &DeadLetter) -> Result<()>;

    /// Up to `max` parked letters for redrive.
    async fn take_dead_letters(&self, max: usize) -> Result<Vec<ParkedLetter>>;

    /// A parked letter has been handled (redriven, re-parked, or quarantined).
    async fn release(&self, id: i64) -> Result<()>;
}
