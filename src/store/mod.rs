//! State store: a versioned key-value contract plus the typed mastery
//! adapter every other component reads and writes through.
//!
//! Keys are `student:{id}:component:{name}`. Writes are compare-and-swap on
//! the version, which is how concurrent engine instances serialize updates to
//! the same key without in-process locks.

pub mod memory;

pub use memory::MemoryStateStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::MasteryRecord;
use crate::resilience::Guarded;

/// A stored value and the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Backend contract. Implementations report transport problems as
/// `Error::Dependency` and a lost CAS as `Error::ConcurrentModification`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a live (non-expired) value.
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>>;

    /// Write `value` if the stored version equals `expected`; `None` means the
    /// key must not exist yet. Returns the new version.
    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<u64>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Schedule a key for erasure after `ttl`. Returns false if it didn't exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Physically remove expired keys. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

pub fn record_key(student_id: &str, component: &str) -> String {
    format!("student:{student_id}:component:{component}")
}

pub fn student_prefix(student_id: &str) -> String {
    format!("student:{student_id}:component:")
}

/// Typed get/CAS over mastery records. Every backend call goes through the
/// state-store guard.
#[derive(Clone)]
pub struct MasteryStore {
    backend: Arc<dyn StateStore>,
    guard: Guarded,
}

impl MasteryStore {
    pub fn new(backend: Arc<dyn StateStore>, guard: Guarded) -> Self {
        Self { backend, guard }
    }

    pub fn guard(&self) -> &Guarded {
        &self.guard
    }

    pub async fn load(
        &self,
        student_id: &str,
        component: &str,
    ) -> Result<Option<Versioned<MasteryRecord>>> {
        let key = record_key(student_id, component);
        let raw = self
            .guard
            .call("get", || self.backend.get(&key))
            .await?;
        match raw {
            Some(v) => Ok(Some(Versioned {
                value: serde_json::from_value(v.value)?,
                version: v.version,
            })),
            None => Ok(None),
        }
    }

    /// CAS write of a whole record. `expected` is the version it was loaded
    /// at, or `None` for a record that didn't exist.
    pub async fn save(&self, record: &MasteryRecord, expected: Option<u64>) -> Result<u64> {
        let key = record_key(&record.student_id, &record.component);
        let value = serde_json::to_value(record)?;
        self.guard
            .call("put_if_version", || {
                self.backend.put_if_version(&key, value.clone(), expected)
            })
            .await
    }

    /// All component records for a student, ordered by component.
    pub async fn list_for_student(&self, student_id: &str) -> Result<Vec<MasteryRecord>> {
        let prefix = student_prefix(student_id);
        let keys = self
            .guard
            .call("keys_with_prefix", || self.backend.keys_with_prefix(&prefix))
            .await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let raw = self.guard.call("get", || self.backend.get(&key)).await?;
            // Expired between listing and reading: skip it.
            if let Some(v) = raw {
                records.push(serde_json::from_value(v.value)?);
            }
        }
        Ok(records)
    }

    /// Compliance erasure: every record of the student expires after `ttl`.
    /// Returns how many records were scheduled.
    pub async fn erase_student(&self, student_id: &str, ttl: Duration) -> Result<usize> {
        if student_id.trim().is_empty() {
            return Err(Error::Validation("student_id is empty".to_string()));
        }
        let prefix = student_prefix(student_id);
        let keys = self
            .guard
            .call("keys_with_prefix", || self.backend.keys_with_prefix(&prefix))
            .await?;

        let mut scheduled = 0;
        for key in keys {
            if self
                .guard
                .call("expire", || self.backend.expire(&key, ttl))
                .await?
            {
                scheduled += 1;
            }
        }
        tracing::info!(student_id, scheduled, ttl_secs = ttl.as_secs(), "erasure scheduled");
        Ok(scheduled)
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        self.guard
            .call("purge_expired", || self.backend.purge_expired())
            .await
    }
}
