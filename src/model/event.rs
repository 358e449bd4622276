//! The message envelope carried on every topic and stored in the event log.

use serde::{Deserialize, Serialize};

use super::RequestId;
use super::state::{LifecycleState, announced};

/// What an event asks for or reports.
///
/// Unknown kinds survive decoding as [`EventKind::Other`] so a consumer can
/// log and skip them instead of rejecting the whole payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Start,
    Stop,
    Predict,
    CleanUp,
    ShutDown,
    InvalidSource,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Predict => "predict",
            EventKind::CleanUp => "clean_up",
            EventKind::ShutDown => "shut_down",
            EventKind::InvalidSource => "invalid_source",
            EventKind::Other(s) => s,
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "start" => EventKind::Start,
            "stop" => EventKind::Stop,
            "predict" => EventKind::Predict,
            "clean_up" => EventKind::CleanUp,
            "shut_down" => EventKind::ShutDown,
            "invalid_source" => EventKind::InvalidSource,
            _ => EventKind::Other(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat envelope: `{state, event, request_uuid, stream_source}`, all strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// State being announced. Empty on the wire for pure commands.
    #[serde(with = "announced", default)]
    pub state: Option<LifecycleState>,
    pub event: EventKind,
    pub request_uuid: RequestId,
    /// Stream URI on ingress; stored frame id on dispatch events.
    #[serde(default)]
    pub stream_source: String,
}

impl Event {
    pub fn new(
        event: EventKind,
        request_uuid: RequestId,
        stream_source: impl Into<String>,
    ) -> Self {
        Self {
            state: None,
            event,
            request_uuid,
            stream_source: stream_source.into(),
        }
    }

    /// Same event announcing `state`.
    pub fn announcing(&self, state: Option<LifecycleState>) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Same request, different kind and source.
    pub fn derive(&self, event: EventKind, stream_source: impl Into<String>) -> Self {
        Self::new(event, self.request_uuid.clone(), stream_source)
    }

    /// Every envelope must be correlated to a request.
    pub fn is_routable(&self) -> bool {
        !self.request_uuid.is_empty()
    }
}
