//! Core data model.
//!
//! A stream instance is identified by its [`RequestId`]. Everything that
//! happens to it travels as an [`Event`] envelope, moves it through the
//! [`LifecycleState`] machine, and is eventually folded into a
//! [`Projection`] for queries.

pub mod event;
pub mod frame;
pub mod projection;
pub mod state;

pub use event::{Event, EventKind};
pub use frame::{Frame, FrameShape};
pub use projection::{Projection, ProjectionRecord};
pub use state::LifecycleState;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request id
// ---------------------------------------------------------------------------

/// Identifier of one stream instance.
///
/// Assigned once at ingress and never changed. It is the only correlation key
/// across topics, stores and worker processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Reserved id returned when ingress rejects a command.
    pub const INVALID: &'static str = "-1";

    /// Fresh random id (UUID v4).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The sentinel returned for rejected commands.
    pub fn invalid() -> Self {
        Self(Self::INVALID.to_string())
    }

    pub fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
