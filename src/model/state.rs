//! Lifecycle state machine of a stream instance.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of a stream instance.
///
/// `Unstarted -> InitStartup -> InStartupProcessing -> Active -> InitShutdown
/// -> InShutdownProcessing -> Inactive`. `Active` is re-entered on every
/// detection dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing has happened yet.
    #[serde(rename = "none")]
    Unstarted,
    /// Start command accepted at ingress.
    InitStartup,
    /// Runner is spawning the capture worker.
    InStartupProcessing,
    /// Samples are flowing into detection.
    Active,
    /// Shutdown requested (externally or by the worker itself).
    InitShutdown,
    /// Workers are being signalled and storage cleared.
    InShutdownProcessing,
    /// Done. Terminal.
    Inactive,
}

impl LifecycleState {
    /// Every state, in lifecycle order.
    pub const ALL: [LifecycleState; 7] = [
        LifecycleState::Unstarted,
        LifecycleState::InitStartup,
        LifecycleState::InStartupProcessing,
        LifecycleState::Active,
        LifecycleState::InitShutdown,
        LifecycleState::InShutdownProcessing,
        LifecycleState::Inactive,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Unstarted, InitStartup)
                | (InitStartup, InStartupProcessing)
                | (InStartupProcessing, Active)
                | (Active, Active)                      // another sample dispatched
                | (InStartupProcessing, InitShutdown)   // stopped or invalid before first sample
                | (InStartupProcessing, Inactive)       // worker failed to spawn
                | (Active, InitShutdown)
                | (InitShutdown, InShutdownProcessing)
                | (InShutdownProcessing, Inactive)
        )
    }

    /// Validate a transition, returning an error if disallowed.
    pub fn transition_to(self, to: LifecycleState) -> Result<LifecycleState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Inactive)
    }

    /// Wire label, as stored in the event log and used as a projection flag name.
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Unstarted => "none",
            LifecycleState::InitStartup => "init_startup",
            LifecycleState::InStartupProcessing => "in_startup_processing",
            LifecycleState::Active => "active",
            LifecycleState::InitShutdown => "init_shutdown",
            LifecycleState::InShutdownProcessing => "in_shutdown_processing",
            LifecycleState::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::UnknownState(s.to_string()))
    }
}

/// Serde adapter for the envelope's `state` field: an empty string means no
/// state is being announced.
pub(crate) mod announced {
    use super::LifecycleState;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        state: &Option<LifecycleState>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(state.map(LifecycleState::as_str).unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<LifecycleState>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(serde::de::Error::custom)
    }
}
