//! In-process `StateStore` for tests and single-node runs.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

use super::{StateStore, Versioned};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Slot {
    value: serde_json::Value,
    version: u64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|t| t > now)
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| Versioned {
                value: slot.value.clone(),
                version: slot.version,
            }))
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<u64> {
        let now = Instant::now();
        let conflict = || Error::ConcurrentModification {
            key: key.to_string(),
        };

        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let live = slot.is_live(now);
                match expected {
                    Some(v) if live && slot.version == v => {
                        slot.value = value;
                        slot.version += 1;
                        Ok(slot.version)
                    }
                    // An expired slot counts as absent.
                    None if !live => {
                        let version = slot.version + 1;
                        *slot = Slot {
                            value,
                            version,
                            expires_at: None,
                        };
                        Ok(version)
                    }
                    _ => Err(conflict()),
                }
            }
            Entry::Vacant(vacant) => match expected {
                None => {
                    vacant.insert(Slot {
                        value,
                        version: 1,
                        expires_at: None,
                    });
                    Ok(1)
                }
                Some(_) => Err(conflict()),
            },
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) if slot.is_live(now) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        Ok((before - self.slots.len()) as u64)
    }
}
