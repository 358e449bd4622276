//! Read model: the last observed lifecycle state of a request plus the
//! labels detected so far.

use serde::{Deserialize, Serialize};

use super::{LifecycleState, RequestId};

/// Query-side snapshot for one request.
///
/// Last write wins on `state`; `detected_objects` mirrors the detection cache
/// at the time the projection was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub request_uuid: RequestId,
    /// `None` when the source row announced no recognised state.
    pub state: Option<LifecycleState>,
    pub detected_objects: Vec<String>,
}

impl Projection {
    pub fn new(
        request_uuid: RequestId,
        state: Option<LifecycleState>,
        detected_objects: Vec<String>,
    ) -> Self {
        Self {
            request_uuid,
            state,
            detected_objects,
        }
    }

    /// Is `state` the one authoritative flag?
    pub fn flag(&self, state: LifecycleState) -> bool {
        self.state == Some(state)
    }
}

const SET: &str = "1";
const UNSET: &str = "0";

fn flag(on: bool) -> String {
    let value = if on { SET } else { UNSET };
    value.to_string()
}

/// Wire format of the fast read store: one `"0"`/`"1"` string per state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionRecord {
    pub request_uuid: String,
    pub init_startup: String,
    pub in_startup_processing: String,
    pub init_shutdown: String,
    pub in_shutdown_processing: String,
    pub active: String,
    pub inactive: String,
    pub detected_objects: Vec<String>,
}

impl Default for ProjectionRecord {
    fn default() -> Self {
        Self {
            request_uuid: String::new(),
            init_startup: UNSET.to_string(),
            in_startup_processing: UNSET.to_string(),
            init_shutdown: UNSET.to_string(),
            in_shutdown_processing: UNSET.to_string(),
            active: UNSET.to_string(),
            inactive: UNSET.to_string(),
            detected_objects: Vec::new(),
        }
    }
}

impl ProjectionRecord {
    /// The state whose flag is set. Ambiguous records (several flags) resolve
    /// to the latest state in lifecycle order.
    pub fn state(&self) -> Option<LifecycleState> {
        [
            (LifecycleState::Inactive, &self.inactive),
            (LifecycleState::InShutdownProcessing, &self.in_shutdown_processing),
            (LifecycleState::InitShutdown, &self.init_shutdown),
            (LifecycleState::Active, &self.active),
            (LifecycleState::InStartupProcessing, &self.in_startup_processing),
            (LifecycleState::InitStartup, &self.init_startup),
        ]
        .into_iter()
        .find(|(_, value)| value.as_str() == SET)
        .map(|(state, _)| state)
    }
}

impl From<&Projection> for ProjectionRecord {
    fn from(p: &Projection) -> Self {
        Self {
            request_uuid: p.request_uuid.to_string(),
            init_startup: flag(p.flag(LifecycleState::InitStartup)),
            in_startup_processing: flag(p.flag(LifecycleState::InStartupProcessing)),
            init_shutdown: flag(p.flag(LifecycleState::InitShutdown)),
            in_shutdown_processing: flag(p.flag(LifecycleState::InShutdownProcessing)),
            active: flag(p.flag(LifecycleState::Active)),
            inactive: flag(p.flag(LifecycleState::Inactive)),
            detected_objects: p.detected_objects.clone(),
        }
    }
}

impl From<ProjectionRecord> for Projection {
    fn from(r: ProjectionRecord) -> Self {
        Self {
            state: r.state(),
            request_uuid: RequestId::from(r.request_uuid),
            detected_objects: r.detected_objects,
        }
    }
}
