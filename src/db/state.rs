//! `StateStore` over the `mastery_state` table.
//!
//! CAS is a conditional `UPDATE ... WHERE version = $expected`; creating a
//! key is an insert that only overwrites an expired row. Zero affected rows
//! means someone else got there first.

use async_trait::async_trait;
use std::time::Duration;

use super::Db;
use crate::error::{Error, Result};
use crate::store::{StateStore, Versioned};

const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

/// Escape LIKE metacharacters so a prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl StateStore for Db {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>> {
        let row: Option<(serde_json::Value, i64)> = sqlx::query_as(&format!(
            "SELECT value, version FROM mastery_state WHERE key = $1 AND {LIVE}"
        ))
        .bind(key)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(value, version)| Versioned {
            value,
            version: version as u64,
        }))
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<u64> {
        let written: Option<(i64,)> = match expected {
            None => {
                sqlx::query_as(
                    "INSERT INTO mastery_state (key, value, version, updated_at)
                     VALUES ($1, $2, 1, now())
                     ON CONFLICT (key) DO UPDATE
                        SET value = EXCLUDED.value,
                            version = mastery_state.version + 1,
                            expires_at = NULL,
                            updated_at = now()
                        WHERE mastery_state.expires_at IS NOT NULL
                          AND mastery_state.expires_at <= now()
                     RETURNING version",
                )
                .bind(key)
                .bind(&value)
                .fetch_optional(self.pool())
                .await?
            }
            Some(version) => {
                sqlx::query_as(&format!(
                    "UPDATE mastery_state
                     SET value = $2, version = version + 1, updated_at = now()
                     WHERE key = $1 AND version = $3 AND {LIVE}
                     RETURNING version"
                ))
                .bind(key)
                .bind(&value)
                .bind(version as i64)
                .fetch_optional(self.pool())
                .await?
            }
        };

        written
            .map(|(version,)| version as u64)
            .ok_or_else(|| Error::ConcurrentModification {
                key: key.to_string(),
            })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT key FROM mastery_state WHERE key LIKE $1 ESCAPE '\\' AND {LIVE} ORDER BY key"
        ))
        .bind(like_prefix(prefix))
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE mastery_state
             SET expires_at = now() + make_interval(secs => $2), updated_at = now()
             WHERE key = $1 AND {LIVE}"
        ))
        .bind(key)
        .bind(ttl.as_secs_f64())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mastery_state WHERE expires_at <= now()")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
