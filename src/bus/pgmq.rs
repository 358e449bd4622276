//! [`Bus`] over Postgres pgmq queues, one queue per topic.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Bus, Delivery, Topic, decode, encode};
use crate::db::Db;
use crate::error::Result;
use crate::model::{Event, LifecycleState};
use crate::telemetry::metrics;

/// Configuration for the pgmq transport.
#[derive(Debug, Clone)]
pub struct PgmqConfig {
    /// Visibility timeout (seconds) for pgmq reads. A message whose take
    /// never commits reappears after this.
    pub visibility_timeout: i32,
    /// Pause between sweeps over empty queues.
    pub poll_interval: Duration,
}

impl Default for PgmqConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: 30,
            poll_interval: Duration::from_millis(100),
        }
    }
}

pub struct PgmqBus {
    db: Arc<Db>,
    config: PgmqConfig,
}

impl PgmqBus {
    pub fn new(db: Arc<Db>, config: PgmqConfig) -> Self {
        Self { db, config }
    }

    /// Create every topic's queue (idempotent).
    pub async fn ensure_topics(&self) -> Result<()> {
        self.db
            .create_queues(Topic::ALL.iter().map(|topic| topic.as_str()))
            .await
    }

    /// One sweep over `topics`; the first message found is taken and decoded.
    async fn read_any(&self, topics: &[Topic]) -> Result<Option<(Topic, Event)>> {
        for &topic in topics {
            let Some(msg) = self
                .db
                .take_from_queue(topic.as_str(), self.config.visibility_timeout)
                .await?
            else {
                continue;
            };

            if msg.is_redelivery() {
                warn!(%topic, msg_id = msg.msg_id, read_ct = msg.read_ct, "redelivered message");
            }

            let decoded = decode(topic, msg.payload);
            if decoded.is_err() {
                metrics::bus_malformed().add(1, &[KeyValue::new("topic", topic.as_str())]);
            }
            return decoded.map(|event| Some((topic, event)));
        }
        Ok(None)
    }
}

#[async_trait]
impl Bus for PgmqBus {
    async fn publish(
        &self,
        event: &Event,
        topic: Topic,
        state: Option<LifecycleState>,
    ) -> Result<()> {
        let payload = encode(event, state)?;
        let msg_id = self.db.send_to_queue(topic.as_str(), &payload).await?;
        metrics::bus_published().add(
            1,
            &[
                KeyValue::new("topic", topic.as_str()),
                KeyValue::new("event", event.event.to_string()),
            ],
        );
        debug!(
            request_uuid = %event.request_uuid,
            event = %event.event,
            state = state.map(LifecycleState::as_str).unwrap_or(""),
            %topic,
            msg_id,
            "event published"
        );
        Ok(())
    }

    async fn consume(&self, topics: &[Topic], timeout: Duration) -> Result<Delivery> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((topic, event)) = self.read_any(topics).await? {
                metrics::bus_consumed().add(1, &[KeyValue::new("topic", topic.as_str())]);
                return Ok(Delivery::Event { topic, event });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Delivery::NoMessage);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}
