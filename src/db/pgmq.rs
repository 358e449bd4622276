//! Topic queues on pgmq.
//!
//! Every bus topic is one pgmq queue. Taking a message reads and archives it
//! in the same transaction, so a payload leaves its queue exactly once
//! whether or not it decodes. The archive table keeps it for inspection.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use crate::error::Result;
use crate::telemetry::metrics;

/// A payload taken off a queue. It is already archived.
#[derive(Debug, Clone)]
pub struct TakenMessage {
    pub msg_id: i64,
    /// Reads so far, this one included. Above one means an earlier reader
    /// died between `pgmq.read` and commit.
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl TakenMessage {
    pub fn is_redelivery(&self) -> bool {
        self.read_ct > 1
    }
}

fn count(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create each queue that does not exist yet.
    pub async fn create_queues<'a>(
        &self,
        queues: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        for queue in queues {
            sqlx::query("SELECT pgmq.create($1)")
                .bind(queue)
                .execute(&self.pool)
                .await?;
            count(queue, "create");
        }
        Ok(())
    }

    /// Append `payload` to `queue`. Returns the pgmq message id.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let (msg_id,): (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue)
            .bind(payload)
            .fetch_one(&self.pool)
            .await?;
        count(queue, "send");
        Ok(msg_id)
    }

    /// Take the oldest visible message of `queue`, or `None` when it is empty.
    ///
    /// `vt_seconds` hides the message from other readers until the archive
    /// commits.
    pub async fn take_from_queue(
        &self,
        queue: &str,
        vt_seconds: i32,
    ) -> Result<Option<TakenMessage>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64, i32, DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, 1)",
        )
        .bind(queue)
        .bind(vt_seconds)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((msg_id, read_ct, enqueued_at, payload)) = row else {
            tx.rollback().await?;
            count(queue, "read_empty");
            return Ok(None);
        };

        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue)
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        count(queue, "take");

        Ok(Some(TakenMessage {
            msg_id,
            read_ct,
            enqueued_at,
            payload,
        }))
    }
}
