//! Message bus: typed envelopes over named topics.
//!
//! `publish` serializes an [`Event`] as a flat JSON record and hands it to the
//! transport. `consume` blocks up to a timeout and yields at most one event.
//! An exhausted topic is not an error. Any other transport failure is
//! returned to the caller, which owns the retry policy.

pub mod memory;
pub mod pgmq;

pub use memory::MemoryBus;
pub use pgmq::PgmqBus;

use async_trait::async_trait;
use std::time::Duration;
use tracing::error;

use crate::error::{Error, Result};
use crate::model::{Event, LifecycleState};

/// Named channels between services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Start/stop commands, consumed by the runner.
    Command,
    /// Sample-ready and clean-up requests, consumed by inference.
    Dispatch,
    /// State announcements from ingress.
    IngressState,
    /// State announcements from the runner.
    RunnerState,
    /// State announcements from inference.
    InferenceState,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Command,
        Topic::Dispatch,
        Topic::IngressState,
        Topic::RunnerState,
        Topic::InferenceState,
    ];

    /// Topics the event log writer subscribes to.
    pub const STATE_TOPICS: [Topic; 3] = [
        Topic::IngressState,
        Topic::RunnerState,
        Topic::InferenceState,
    ];

    /// Queue name on the transport.
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Command => "api_runner",
            Topic::Dispatch => "runner_inference",
            Topic::IngressState => "api_fsm_st",
            Topic::RunnerState => "runner_fsm_st",
            Topic::InferenceState => "inference_fsm_st",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one consume call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Timeout elapsed (or every topic is drained).
    NoMessage,
    Event { topic: Topic, event: Event },
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Send `event` on `topic`, announcing `state`.
    ///
    /// Ordering holds only among messages with the same `request_uuid` on the
    /// same topic.
    async fn publish(
        &self,
        event: &Event,
        topic: Topic,
        state: Option<LifecycleState>,
    ) -> Result<()>;

    /// Wait up to `timeout` for the next event on any of `topics`.
    ///
    /// Returns [`Error::MalformedPayload`] when a message cannot be decoded;
    /// the message is consumed either way.
    async fn consume(&self, topics: &[Topic], timeout: Duration) -> Result<Delivery>;

    /// Fire-and-forget publish: failures are logged, never returned.
    async fn announce(&self, event: &Event, topic: Topic, state: Option<LifecycleState>) {
        if let Err(e) = self.publish(event, topic, state).await {
            error!(
                request_uuid = %event.request_uuid,
                event = %event.event,
                %topic,
                error = %e,
                "failed to publish event"
            );
        }
    }
}

/// Decode a raw payload taken off `topic`.
pub(crate) fn decode(topic: Topic, payload: serde_json::Value) -> Result<Event> {
    let event: Event =
        serde_json::from_value(payload).map_err(|e| Error::MalformedPayload {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
    if !event.is_routable() {
        return Err(Error::MalformedPayload {
            topic: topic.to_string(),
            reason: "empty request_uuid".to_string(),
        });
    }
    Ok(event)
}

/// Encode `event` for the wire, announcing `state`.
pub(crate) fn encode(event: &Event, state: Option<LifecycleState>) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(event.announcing(state))?)
}
