//! Projector: relays log rows into the read store, last write wins.

use async_trait::async_trait;
use farseer_rs::error::{Error, Result};
use farseer_rs::model::{
    Event, EventKind, LifecycleState, Projection, ProjectionRecord, RequestId,
};
use farseer_rs::service::{Projector, ProjectorConfig, RetryPolicy};
use farseer_rs::store::{
    DetectionCache, EventLog, MemoryDetectionCache, MemoryEventLog, MemoryProjectionStore,
    ProjectionStore, query_projection,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config(batch: i64) -> ProjectorConfig {
    ProjectorConfig {
        interval: Duration::from_millis(10),
        batch,
        retry: RetryPolicy::new(3, Duration::from_millis(10)),
    }
}

struct Harness {
    log: Arc<MemoryEventLog>,
    cache: Arc<MemoryDetectionCache>,
    store: Arc<MemoryProjectionStore>,
    projector: Projector,
}

fn harness(batch: i64) -> Harness {
    let log = Arc::new(MemoryEventLog::new());
    let cache = Arc::new(MemoryDetectionCache::new());
    let store = Arc::new(MemoryProjectionStore::new());
    let projector = Projector::new(log.clone(), cache.clone(), store.clone(), config(batch));
    Harness {
        log,
        cache,
        store,
        projector,
    }
}

async fn record(log: &MemoryEventLog, request: &RequestId, state: LifecycleState) -> i64 {
    let event = Event::new(EventKind::Start, request.clone(), "rtsp://camera/1")
        .announcing(Some(state));
    log.record(&event).await.unwrap().event_id
}

fn labels(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Accepts `limit` writes, then fails every write.
struct FlakyStore {
    inner: MemoryProjectionStore,
    limit: usize,
    attempts: AtomicUsize,
}

#[async_trait]
impl ProjectionStore for FlakyStore {
    async fn put(&self, projection: &Projection) -> Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(Error::Transport("read store unavailable".to_string()));
        }
        self.inner.put(projection).await
    }

    async fn get(&self, request: &RequestId) -> Result<Option<ProjectionRecord>> {
        self.inner.get(request).await
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn projects_the_latest_state_with_cached_labels() {
    let h = harness(100);
    let request = RequestId::new();
    record(&h.log, &request, LifecycleState::InitStartup).await;
    record(&h.log, &request, LifecycleState::InStartupProcessing).await;
    let last = record(&h.log, &request, LifecycleState::Active).await;
    h.cache.append(&request, &labels(&["person", "car"])).await.unwrap();

    assert_eq!(h.projector.project_once().await.unwrap(), 3);
    assert_eq!(h.projector.cursor(), last);

    let record = query_projection(h.store.as_ref(), &request).await.unwrap();
    assert_eq!(record.request_uuid, request.as_str());
    assert_eq!(record.state(), Some(LifecycleState::Active));
    assert_eq!(record.active, "1");
    assert_eq!(record.init_startup, "0");
    assert_eq!(record.in_startup_processing, "0");
    assert_eq!(record.detected_objects, ["person", "car"]);
}

#[tokio::test]
async fn nothing_new_projects_nothing() {
    let h = harness(100);
    let request = RequestId::new();
    record(&h.log, &request, LifecycleState::InitStartup).await;

    assert_eq!(h.projector.project_once().await.unwrap(), 1);
    assert_eq!(h.projector.project_once().await.unwrap(), 0);
    assert_eq!(h.store.writes(), 1);
}

#[tokio::test]
async fn unknown_request_answers_the_default_record() {
    let h = harness(100);

    let record = query_projection(h.store.as_ref(), &RequestId::new())
        .await
        .unwrap();
    assert_eq!(record, ProjectionRecord::default());
    assert_eq!(record.state(), None);
}

#[tokio::test]
async fn final_record_is_inactive_even_with_labels_left() {
    let h = harness(100);
    let request = RequestId::new();
    h.cache.append(&request, &labels(&["dog"])).await.unwrap();
    for state in [
        LifecycleState::InitStartup,
        LifecycleState::InStartupProcessing,
        LifecycleState::Active,
        LifecycleState::InitShutdown,
        LifecycleState::InShutdownProcessing,
        LifecycleState::Inactive,
    ] {
        record(&h.log, &request, state).await;
    }

    h.projector.project_once().await.unwrap();

    let record = query_projection(h.store.as_ref(), &request).await.unwrap();
    assert_eq!(record.state(), Some(LifecycleState::Inactive));
    assert_eq!(record.active, "0");
    assert_eq!(record.detected_objects, ["dog"]);
}

#[tokio::test]
async fn replay_from_an_earlier_cursor_is_idempotent() {
    let h = harness(100);
    let request = RequestId::new();
    record(&h.log, &request, LifecycleState::InitStartup).await;
    record(&h.log, &request, LifecycleState::InStartupProcessing).await;
    h.projector.project_once().await.unwrap();
    let before = query_projection(h.store.as_ref(), &request).await.unwrap();

    h.projector.set_cursor(0);
    assert_eq!(h.projector.project_once().await.unwrap(), 2);

    let after = query_projection(h.store.as_ref(), &request).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn drains_the_backlog_in_batches() {
    let h = harness(2);
    let requests: Vec<RequestId> = (0..5).map(|_| RequestId::new()).collect();
    for request in &requests {
        record(&h.log, request, LifecycleState::InitStartup).await;
    }

    assert_eq!(h.projector.project_once().await.unwrap(), 5);
    for request in &requests {
        let record = query_projection(h.store.as_ref(), request).await.unwrap();
        assert_eq!(record.state(), Some(LifecycleState::InitStartup));
    }
}

#[tokio::test]
async fn non_positive_batch_still_terminates() {
    for batch in [0, -5] {
        let h = harness(batch);
        let request = RequestId::new();
        record(&h.log, &request, LifecycleState::InitStartup).await;
        let last = record(&h.log, &request, LifecycleState::InStartupProcessing).await;

        let projected = tokio::time::timeout(Duration::from_secs(5), h.projector.project_once())
            .await
            .expect("projection cycle never finished")
            .unwrap();
        assert_eq!(projected, 2);
        assert_eq!(h.projector.cursor(), last);

        let empty = tokio::time::timeout(Duration::from_secs(5), h.projector.project_once())
            .await
            .expect("idle projection cycle never finished")
            .unwrap();
        assert_eq!(empty, 0);
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn log_outage_skips_the_cycle() {
    let h = harness(100);
    let request = RequestId::new();
    record(&h.log, &request, LifecycleState::InitStartup).await;
    h.log.set_unavailable(true);

    assert_eq!(h.projector.project_once().await.unwrap(), 0);
    assert_eq!(h.projector.cursor(), 0);

    h.log.set_unavailable(false);
    assert_eq!(h.projector.project_once().await.unwrap(), 1);
}

#[tokio::test]
async fn failed_write_keeps_the_cursor_on_the_last_written_row() {
    let log = Arc::new(MemoryEventLog::new());
    let store = Arc::new(FlakyStore {
        inner: MemoryProjectionStore::new(),
        limit: 2,
        attempts: AtomicUsize::new(0),
    });
    let projector = Projector::new(
        log.clone(),
        Arc::new(MemoryDetectionCache::new()),
        store.clone(),
        config(100),
    );
    let request = RequestId::new();
    record(&log, &request, LifecycleState::InitStartup).await;
    let second = record(&log, &request, LifecycleState::InStartupProcessing).await;
    record(&log, &request, LifecycleState::Active).await;

    assert!(projector.project_once().await.is_err());
    assert_eq!(projector.cursor(), second);

    let record = query_projection(store.as_ref(), &request).await.unwrap();
    assert_eq!(record.state(), Some(LifecycleState::InStartupProcessing));
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let h = harness(100);
    let request = RequestId::new();
    record(&h.log, &request, LifecycleState::InitStartup).await;

    let projector = h.projector.clone();
    let task = tokio::spawn(async move { projector.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.projector.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(h.projector.cursor(), 1);
}
