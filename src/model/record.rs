//! Durable per (student, component) mastery state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::event::{LearningEvent, MasteryUpdated, SubScores};
use crate::mastery;

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// A point-in-time mastery value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub at: DateTime<Utc>,
    pub mastery: f64,
}

/// Fixed-capacity, timestamp-ordered snapshot buffer. The oldest snapshot is
/// evicted once capacity is reached.
///
/// Timestamps are strictly increasing: a snapshot landing on an existing
/// timestamp replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    capacity: usize,
    snapshots: VecDeque<Snapshot>,
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            snapshots: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        match self.snapshots.back() {
            None => self.snapshots.push_back(snapshot),
            Some(last) if snapshot.at > last.at => self.snapshots.push_back(snapshot),
            Some(_) => match self
                .snapshots
                .binary_search_by(|probe| probe.at.cmp(&snapshot.at))
            {
                Ok(i) => self.snapshots[i] = snapshot,
                Err(i) => self.snapshots.insert(i, snapshot),
            },
        }
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    pub fn to_vec(&self) -> Vec<Snapshot> {
        self.snapshots.iter().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Mastery Record
// ---------------------------------------------------------------------------

/// The engine's source of truth for one student's proficiency in one
/// component. Written only by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub student_id: String,
    pub component: String,
    /// Sub-scores from the most recently applied event.
    pub current_scores: SubScores,
    /// Always `mastery::weighted(&current_scores)`.
    pub mastery: f64,
    pub history: History,
    pub last_idempotency_key: Option<String>,
    /// Idempotency keys applied recently, oldest first.
    #[serde(default)]
    pub recent_keys: VecDeque<String>,
    pub updated_at: DateTime<Utc>,
}

impl MasteryRecord {
    /// An empty record that any event will be applied to.
    pub fn new(
        student_id: impl Into<String>,
        component: impl Into<String>,
        history_capacity: usize,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            component: component.into(),
            current_scores: SubScores::new(0.0, 0.0, 0.0, 0.0),
            mastery: 0.0,
            history: History::with_capacity(history_capacity),
            last_idempotency_key: None,
            recent_keys: VecDeque::new(),
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Has this logical event already been folded in?
    pub fn has_applied(&self, idempotency_key: &str) -> bool {
        self.last_idempotency_key.as_deref() == Some(idempotency_key)
            || self.recent_keys.iter().any(|k| k == idempotency_key)
    }

    /// Strictly older than what we've already applied, and not a correction.
    pub fn is_stale(&self, event: &LearningEvent) -> bool {
        !event.correction && event.occurred_at < self.updated_at
    }

    /// Fold an accepted event into the record. Callers decide acceptance
    /// (dedupe, ordering) before calling this.
    pub fn apply(&mut self, event: &LearningEvent, dedupe_window: usize) {
        self.current_scores = event.scores.clamped();
        self.mastery = mastery::weighted(&self.current_scores);
        self.history.push(Snapshot {
            at: event.occurred_at,
            mastery: self.mastery,
        });
        self.updated_at = self.updated_at.max(event.occurred_at);
        self.remember(&event.idempotency_key, dedupe_window);
    }

    /// Fold a late event into history only: its snapshot lands at its own
    /// timestamp while `current_scores`, `mastery` and `updated_at` keep
    /// describing the newest event.
    pub fn backfill(&mut self, event: &LearningEvent, dedupe_window: usize) {
        self.history.push(Snapshot {
            at: event.occurred_at,
            mastery: mastery::weighted(&event.scores.clamped()),
        });
        self.remember(&event.idempotency_key, dedupe_window);
    }

    fn remember(&mut self, idempotency_key: &str, dedupe_window: usize) {
        self.last_idempotency_key = Some(idempotency_key.to_string());
        self.recent_keys.push_back(idempotency_key.to_string());
        while self.recent_keys.len() > dedupe_window.max(1) {
            self.recent_keys.pop_front();
        }
    }

    /// Re-derive `mastery` from `current_scores` (replay/backfill path).
    /// Returns true if the stored value drifted from the formula.
    pub fn recompute(&mut self) -> bool {
        let expected = mastery::weighted(&self.current_scores);
        let drifted = (expected - self.mastery).abs() > mastery::TOLERANCE;
        self.mastery = expected;
        drifted
    }

    pub fn summary(&self) -> MasteryUpdated {
        MasteryUpdated {
            student_id: self.student_id.clone(),
            component: self.component.clone(),
            mastery: self.mastery,
            occurred_at: self.updated_at,
        }
    }
}
