//! In-process bus for tests and single-node runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{DeadLetter, DeadLetterSink, Delivery, EventSink, EventSource, ParkedLetter};
use crate::error::Result;
use crate::model::{LearningEvent, MasteryUpdated};

#[derive(Default)]
struct Queues {
    pending: VecDeque<Delivery>,
    in_flight: BTreeMap<i64, Delivery>,
    published: Vec<MasteryUpdated>,
    dead: VecDeque<ParkedLetter>,
    dead_in_flight: BTreeMap<i64, ParkedLetter>,
    quarantined: Vec<DeadLetter>,
}

/// Source, sink and dead-letter store in one. Unacked deliveries stay in
/// flight until [`MemoryBus::redeliver_unacked`] puts them back.
#[derive(Default)]
pub struct MemoryBus {
    next_id: AtomicI64,
    queues: Mutex<Queues>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enqueue a learning event. Returns its delivery id.
    pub fn push(&self, event: &LearningEvent) -> Result<i64> {
        self.push_raw(serde_json::to_value(event)?)
    }

    /// Enqueue an arbitrary payload (e.g. a malformed message).
    pub fn push_raw(&self, payload: serde_json::Value) -> Result<i64> {
        let id = self.next_id();
        self.queues().pending.push_back(Delivery {
            id,
            read_count: 0,
            payload,
        });
        Ok(id)
    }

    /// Simulate visibility timeouts: everything unacked goes back to the
    /// front of the queue in its original order.
    pub fn redeliver_unacked(&self) {
        let mut q = self.queues();
        let unacked = std::mem::take(&mut q.in_flight);
        for (_, delivery) in unacked.into_iter().rev() {
            q.pending.push_front(delivery);
        }
        let dead = std::mem::take(&mut q.dead_in_flight);
        for (_, parked) in dead.into_iter().rev() {
            q.dead.push_front(parked);
        }
    }

    pub fn pending(&self) -> usize {
        self.queues().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.queues().in_flight.len()
    }

    pub fn published(&self) -> Vec<MasteryUpdated> {
        self.queues().published.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let q = self.queues();
        q.dead
            .iter()
            .chain(q.dead_in_flight.values())
            .map(|p| p.letter.clone())
            .collect()
    }

    pub fn quarantined(&self) -> Vec<DeadLetter> {
        self.queues().quarantined.clone()
    }
}

#[async_trait]
impl EventSource for MemoryBus {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut q = self.queues();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut delivery) = q.pending.pop_front() else {
                break;
            };
            delivery.read_count += 1;
            q.in_flight.insert(delivery.id, delivery.clone());
            out.push(delivery);
        }
        Ok(out)
    }

    async fn ack(&self, delivery_id: i64) -> Result<()> {
        self.queues().in_flight.remove(&delivery_id);
        Ok(())
    }
}

#[async_trait]
impl EventSink for MemoryBus {
    async fn publish(&self, event: &MasteryUpdated) -> Result<()> {
        self.queues().published.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for MemoryBus {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let id = self.next_id();
        self.queues().dead.push_back(ParkedLetter {
            id,
            letter: letter.clone(),
        });
        Ok(())
    }

    async fn quarantine(&self, letter: &DeadLetter) -> Result<()> {
        self.queues().quarantined.push(letter.clone());
        Ok(())
    }

    async fn take_dead_letters(&self, max: usize) -> Result<Vec<ParkedLetter>> {
        let mut q = self.queues();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(parked) = q.dead.pop_front() else {
                break;
            };
            q.dead_in_flight.insert(parked.id, parked.clone());
            out.push(parked);
        }
        Ok(out)
    }

    async fn release(&self, id: i64) -> Result<()> {
        self.queues().dead_in_flight.remove(&id);
        Ok(())
    }
}
