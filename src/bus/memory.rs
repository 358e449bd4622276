//! In-process [`Bus`] for tests and single-binary deployments.
//!
//! Payloads are stored encoded, so the wire format is exercised exactly as
//! with a real transport. Every publication is also kept in a journal for
//! assertions.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Bus, Delivery, Topic, decode, encode};
use crate::error::{Error, Result};
use crate::model::{Event, LifecycleState};

type Queues = HashMap<Topic, VecDeque<serde_json::Value>>;

#[derive(Default)]
pub struct MemoryBus {
    queues: Mutex<Queues>,
    journal: Mutex<Vec<(Topic, Event)>>,
    notify: Notify,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw payload, bypassing encoding.
    pub fn push_raw(&self, topic: Topic, payload: serde_json::Value) {
        self.lock_queues()
            .entry(topic)
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
    }

    /// Every event published so far, in order, with the announced state applied.
    pub fn published(&self) -> Vec<(Topic, Event)> {
        self.lock_journal().clone()
    }

    /// Events published on `topic`.
    pub fn published_on(&self, topic: Topic) -> Vec<Event> {
        self.lock_journal()
            .iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Messages still waiting on `topic`.
    pub fn pending(&self, topic: Topic) -> usize {
        self.lock_queues().get(&topic).map_or(0, VecDeque::len)
    }

    fn pop(&self, topics: &[Topic]) -> Option<(Topic, serde_json::Value)> {
        let mut queues = self.lock_queues();
        topics.iter().find_map(|&topic| {
            queues
                .get_mut(&topic)
                .and_then(VecDeque::pop_front)
                .map(|payload| (topic, payload))
        })
    }

    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_journal(&self) -> MutexGuard<'_, Vec<(Topic, Event)>> {
        self.journal.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(
        &self,
        event: &Event,
        topic: Topic,
        state: Option<LifecycleState>,
    ) -> Result<()> {
        let payload = encode(event, state)?;
        self.lock_journal().push((topic, event.announcing(state)));
        self.push_raw(topic, payload);
        Ok(())
    }

    async fn consume(&self, topics: &[Topic], timeout: Duration) -> Result<Delivery> {
        if topics.is_empty() {
            return Err(Error::Transport("no topics to consume".to_string()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking, so a publish in between is not missed.
            let notified = self.notify.notified();
            if let Some((topic, payload)) = self.pop(topics) {
                let event = decode(topic, payload)?;
                return Ok(Delivery::Event { topic, event });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Delivery::NoMessage);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Delivery::NoMessage);
            }
        }
    }
}
