//! In-memory storage backends.
//!
//! Same contracts as the Postgres and filesystem backends. Used by the test
//! suite and for running the whole pipeline inside one process.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{
    BlobStore, DetectionCache, EventLog, LoggedEvent, ProjectionStore, Recorded, meaningful,
    namespace_segment,
};
use crate::error::{Error, Result};
use crate::model::{Event, Frame, Projection, ProjectionRecord, RequestId};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LogInner {
    latest: HashMap<RequestId, Event>,
    rows: Vec<LoggedEvent>,
}

/// In-memory event log with an outage switch.
#[derive(Default)]
pub struct MemoryEventLog {
    inner: Mutex<LogInner>,
    unavailable: AtomicBool,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails as a lost connection would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every appended row.
    pub fn rows(&self) -> Vec<LoggedEvent> {
        lock(&self.inner).rows.clone()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Transport("event log unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn record(&self, event: &Event) -> Result<Recorded> {
        self.check()?;
        let mut inner = lock(&self.inner);
        let previous = inner
            .latest
            .insert(event.request_uuid.clone(), event.clone())
            .and_then(|e| e.state);
        let event_id = inner.rows.last().map_or(1, |r| r.event_id + 1);
        inner.rows.push(LoggedEvent {
            event_id,
            event: event.clone(),
            recorded_at: Utc::now(),
        });
        Ok(Recorded { event_id, previous })
    }

    async fn events_since(&self, after: i64, limit: i64) -> Result<Vec<LoggedEvent>> {
        self.check()?;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(lock(&self.inner)
            .rows
            .iter()
            .filter(|r| r.event_id > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest(&self, request: &RequestId) -> Result<Option<Event>> {
        self.check()?;
        Ok(lock(&self.inner).latest.get(request).cloned())
    }
}

// ---------------------------------------------------------------------------
// Detection cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDetectionCache {
    labels: Mutex<HashMap<RequestId, Vec<String>>>,
}

impl MemoryDetectionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DetectionCache for MemoryDetectionCache {
    async fn append(&self, request: &RequestId, labels: &[String]) -> Result<usize> {
        let mut map = lock(&self.labels);
        let entry = map.entry(request.clone()).or_default();
        let before = entry.len();
        entry.extend(meaningful(labels).cloned());
        Ok(entry.len() - before)
    }

    async fn labels(&self, request: &RequestId) -> Result<Vec<String>> {
        Ok(lock(&self.labels).get(request).cloned().unwrap_or_default())
    }

    async fn clear(&self, request: &RequestId) -> Result<u64> {
        Ok(lock(&self.labels)
            .remove(request)
            .map_or(0, |labels| labels.len() as u64))
    }
}

// ---------------------------------------------------------------------------
// Projection store
// ---------------------------------------------------------------------------

/// Keeps encoded records, like a key-value store would.
#[derive(Default)]
pub struct MemoryProjectionStore {
    records: Mutex<HashMap<RequestId, serde_json::Value>>,
    writes: Mutex<u64>,
}

impl MemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an arbitrary payload under `request`.
    pub fn put_raw(&self, request: &RequestId, value: serde_json::Value) {
        lock(&self.records).insert(request.clone(), value);
    }

    /// Number of successful `put` calls.
    pub fn writes(&self) -> u64 {
        *lock(&self.writes)
    }
}

#[async_trait]
impl ProjectionStore for MemoryProjectionStore {
    async fn put(&self, projection: &Projection) -> Result<()> {
        let record = ProjectionRecord::from(projection);
        let value = serde_json::to_value(&record)?;
        lock(&self.records).insert(projection.request_uuid.clone(), value);
        *lock(&self.writes) += 1;
        Ok(())
    }

    async fn get(&self, request: &RequestId) -> Result<Option<ProjectionRecord>> {
        let Some(value) = lock(&self.records).get(request).cloned() else {
            return Ok(None);
        };
        Ok(Some(super::decode_record(request, value)))
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

pub struct MemoryBlobStore {
    bucket: String,
    objects: Mutex<HashMap<String, Frame>>,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Object ids currently stored for `request`.
    pub fn objects_for(&self, request: &RequestId) -> Vec<String> {
        let prefix = format!("{}/{}/", self.bucket, request);
        let mut ids: Vec<String> = lock(&self.objects)
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_frame(&self, request: &RequestId, frame: &Frame) -> Result<String> {
        let segment = namespace_segment(request)?;
        let frame_id = format!("{}/{}/{}", self.bucket, segment, Uuid::new_v4());
        lock(&self.objects).insert(frame_id.clone(), frame.clone());
        Ok(frame_id)
    }

    async fn get_frame(&self, frame_id: &str) -> Result<Option<Frame>> {
        Ok(lock(&self.objects).get(frame_id).cloned())
    }

    async fn clear(&self, request: &RequestId) -> Result<()> {
        let prefix = format!("{}/{}/", self.bucket, namespace_segment(request)?);
        lock(&self.objects).retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }
}
