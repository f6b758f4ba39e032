//! pgmq queue operations via direct SQLx.
//!
//! Thin wrappers over pgmq's SQL functions (`create`, `send`, `read`,
//! `archive`, `metrics`). Every call is counted in
//! `mastery.queue.operations`.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use crate::error::Result;
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Visible again to other readers after this instant unless archived.
    pub vt: DateTime<Utc>,
    pub message: serde_json::Value,
}

type MessageRow = (i64, i32, DateTime<Utc>, DateTime<Utc>, serde_json::Value);

fn count(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        count(queue_name, "create");
        Ok(())
    }

    /// Send a message immediately. Returns the message id.
    pub async fn send_to_queue(&self, queue_name: &str, payload: &serde_json::Value) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue_name)
            .bind(payload)
            .fetch_one(self.pool())
            .await?;
        count(queue_name, "send");
        Ok(row.0)
    }

    /// Read up to `qty` messages, hiding them from other readers for
    /// `vt_seconds`.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        qty: i32,
    ) -> Result<Vec<PgmqMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3)",
        )
        .bind(queue_name)
        .bind(vt_seconds)
        .bind(qty)
        .fetch_all(self.pool())
        .await?;

        count(queue_name, if rows.is_empty() { "read_empty" } else { "read" });
        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
                msg_id,
                read_ct,
                enqueued_at,
                vt,
                message,
            })
            .collect())
    }

    /// Move a message to the queue's archive table. Archived messages are
    /// never redelivered but stay queryable for audit and replay.
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2::bigint)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        count(queue_name, "archive");
        Ok(())
    }

    /// Messages currently in a queue, visible or not.
    pub async fn queue_length(&self, queue_name: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(queue_name)
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}
