//! Storage contracts the services depend on.
//!
//! Each trait names only the operations the orchestration layer needs. The
//! Postgres implementations live in [`crate::db`]; [`memory`] holds in-process
//! versions and [`blob::FsBlobStore`] keeps frames on the local filesystem.

pub mod blob;
pub mod memory;

pub use blob::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryDetectionCache, MemoryEventLog, MemoryProjectionStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{Event, Frame, LifecycleState, Projection, ProjectionRecord, RequestId};

/// One row of the append-only event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    /// Monotonic, gap-tolerant sequence id.
    pub event_id: i64,
    pub event: Event,
    pub recorded_at: DateTime<Utc>,
}

/// What [`EventLog::record`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub event_id: i64,
    /// Latest state of the request before this write, if one was known.
    pub previous: Option<LifecycleState>,
}

/// Durable history plus a latest-state row per request.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Upsert the latest-state row and append to the log, atomically.
    async fn record(&self, event: &Event) -> Result<Recorded>;

    /// Rows with `event_id > after`, ascending, at most `limit`.
    async fn events_since(&self, after: i64, limit: i64) -> Result<Vec<LoggedEvent>>;

    /// Latest-state row for `request`.
    async fn latest(&self, request: &RequestId) -> Result<Option<Event>>;
}

/// Labels accumulated by detection, namespaced by request.
#[async_trait]
pub trait DetectionCache: Send + Sync {
    /// Append labels (never replaces). Returns how many were stored.
    async fn append(&self, request: &RequestId, labels: &[String]) -> Result<usize>;

    /// Everything appended so far, in order.
    async fn labels(&self, request: &RequestId) -> Result<Vec<String>>;

    /// Drop the namespace. Returns the number of entries removed.
    async fn clear(&self, request: &RequestId) -> Result<u64>;
}

/// The fast read store queried by clients.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Overwrite the record for the projection's request.
    async fn put(&self, projection: &Projection) -> Result<()>;

    /// Stored record, if any.
    async fn get(&self, request: &RequestId) -> Result<Option<ProjectionRecord>>;
}

/// Frame storage, laid out as `{bucket}/{request_uuid}/{sample_uuid}`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `frame`; returns its object id.
    async fn put_frame(&self, request: &RequestId, frame: &Frame) -> Result<String>;

    /// Fetch a frame. `None` if it is gone (e.g. the namespace was cleared).
    async fn get_frame(&self, frame_id: &str) -> Result<Option<Frame>>;

    /// Remove every object under the request's namespace.
    async fn clear(&self, request: &RequestId) -> Result<()>;
}

/// Query the read model. Missing records answer with the default record.
pub async fn query_projection(
    store: &dyn ProjectionStore,
    request: &RequestId,
) -> Result<ProjectionRecord> {
    match store.get(request).await? {
        Some(record) => Ok(record),
        None => {
            warn!(request_uuid = %request, "no projection for request");
            Ok(ProjectionRecord::default())
        }
    }
}

/// Decode a stored record; malformed records degrade to the default one.
pub(crate) fn decode_record(request: &RequestId, value: serde_json::Value) -> ProjectionRecord {
    serde_json::from_value(value).unwrap_or_else(|e| {
        warn!(request_uuid = %request, error = %e, "malformed projection record");
        ProjectionRecord::default()
    })
}

/// Drop empty labels (detectors pad their output) before caching.
pub(crate) fn meaningful(labels: &[String]) -> impl Iterator<Item = &String> {
    labels.iter().filter(|l| !l.trim().is_empty())
}

/// The request id as one blob namespace segment.
///
/// Ids that would nest inside another request's namespace (`a/b`) or climb
/// out of the bucket (`..`) are refused.
pub(crate) fn namespace_segment(request: &RequestId) -> Result<&str> {
    let id = request.as_str();
    let mut components = Path::new(id).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single || id.contains(['/', '\\']) {
        return Err(Error::Blob(format!(
            "request id {id:?} is not a single namespace segment"
        )));
    }
    Ok(id)
}
