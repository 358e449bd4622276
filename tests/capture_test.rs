//! Capture worker: sampling window, invalid-source threshold, failure paths.

use async_trait::async_trait;
use farseer_rs::bus::{MemoryBus, Topic};
use farseer_rs::capture::{
    CaptureOutcome, CaptureSettings, CaptureWorker, FfmpegSource, FrameSource, Sample, sample,
};
use farseer_rs::error::{Error, Result};
use farseer_rs::model::{Event, EventKind, Frame, FrameShape, LifecycleState, RequestId};
use farseer_rs::store::{BlobStore, MemoryBlobStore};
use std::collections::VecDeque;
use std::sync::Arc;

const SHAPE: FrameShape = FrameShape {
    height: 2,
    width: 4,
    channels: 3,
};

#[derive(Clone, Copy)]
enum Read {
    Good,
    Bad,
    Broken,
}
use Read::{Bad, Broken, Good};

/// Plays back a fixed sequence of reads; good frames are filled with their
/// 1-based index. Runs out into failed reads.
struct ScriptedSource {
    script: VecDeque<Read>,
    good: u8,
}

impl ScriptedSource {
    fn new(script: &[Read]) -> Self {
        Self {
            script: script.iter().copied().collect(),
            good: 0,
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        match self.script.pop_front().unwrap_or(Bad) {
            Good => {
                self.good += 1;
                Ok(Some(Frame::new(SHAPE, vec![self.good; SHAPE.byte_len()])))
            }
            Bad => Ok(None),
            Broken => Err(Error::Io(std::io::Error::other("decoder crashed"))),
        }
    }
}

fn settings() -> CaptureSettings {
    CaptureSettings::new(SHAPE, 5, 3).unwrap()
}

struct Harness {
    bus: Arc<MemoryBus>,
    blobs: Arc<MemoryBlobStore>,
    worker: CaptureWorker,
    start: Event,
}

fn harness() -> Harness {
    let bus = Arc::new(MemoryBus::new());
    let blobs = Arc::new(MemoryBlobStore::new("frames"));
    let worker = CaptureWorker::new(blobs.clone(), bus.clone(), settings());
    let start = Event::new(EventKind::Start, RequestId::new(), "rtsp://camera/1");
    Harness {
        bus,
        blobs,
        worker,
        start,
    }
}

fn scripted(script: &'static [Read]) -> impl FnOnce(&str, FrameShape) -> Result<ScriptedSource> {
    move |_, _| Ok(ScriptedSource::new(script))
}

fn assert_shutdown_requested(h: &Harness) {
    let commands = h.bus.published_on(Topic::Command);
    assert_eq!(commands.len(), 1, "{commands:?}");
    assert_eq!(commands[0].event, EventKind::InvalidSource);
    assert_eq!(commands[0].state, Some(LifecycleState::InitShutdown));
    assert_eq!(commands[0].request_uuid, h.start.request_uuid);
    assert!(h.bus.published_on(Topic::Dispatch).is_empty());
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn window_of_good_frames_samples_the_last_one() {
    let mut source = ScriptedSource::new(&[Good; 7]);
    let result = sample(&mut source, &settings()).await.unwrap();
    match result {
        Sample::Frame(frame) => assert_eq!(frame.data[0], 5),
        other => panic!("expected a frame, got {other:?}"),
    }
    // Reading stops at the window.
    assert_eq!(source.script.len(), 2);
}

#[tokio::test]
async fn failed_reads_below_threshold_do_not_prevent_sampling() {
    let mut source = ScriptedSource::new(&[Bad, Good, Bad, Good, Good, Good, Good]);
    let result = sample(&mut source, &settings()).await.unwrap();
    assert!(matches!(result, Sample::Frame(_)));
}

#[tokio::test]
async fn corrupted_count_is_not_reset_by_good_frames() {
    let mut source = ScriptedSource::new(&[Bad, Good, Bad, Good, Bad, Good]);
    let result = sample(&mut source, &settings()).await.unwrap();
    assert_eq!(result, Sample::Invalid { corrupted: 3 });
}

#[tokio::test]
async fn broken_source_is_an_error() {
    let mut source = ScriptedSource::new(&[Good, Broken]);
    assert!(sample(&mut source, &settings()).await.is_err());
}

#[test]
fn settings_require_threshold_below_window() {
    assert!(matches!(
        CaptureSettings::new(SHAPE, 5, 5),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        CaptureSettings::new(SHAPE, 5, 9),
        Err(Error::Config(_))
    ));
    assert!(CaptureSettings::new(SHAPE, 0, 0).is_err());
    assert!(CaptureSettings::new(SHAPE, 5, 0).is_err());

    let defaults = CaptureSettings::default();
    assert!(defaults.invalid_frame_threshold < defaults.sampling_window);
}

// ---------------------------------------------------------------------------
// Worker runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sampled_frame_is_stored_and_dispatched() {
    let h = harness();
    let outcome = h.worker.run(&h.start, scripted(&[Good; 5])).await;

    let CaptureOutcome::Sampled { frame_id } = outcome else {
        panic!("expected a sample, got {outcome:?}");
    };
    assert_eq!(h.blobs.objects_for(&h.start.request_uuid), [frame_id.clone()]);
    let stored = h.blobs.get_frame(&frame_id).await.unwrap().unwrap();
    assert_eq!(stored.shape, SHAPE);

    let dispatched = h.bus.published_on(Topic::Dispatch);
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].event, EventKind::Predict);
    assert_eq!(dispatched[0].state, Some(LifecycleState::Active));
    assert_eq!(dispatched[0].stream_source, frame_id);
    assert_eq!(dispatched[0].request_uuid, h.start.request_uuid);
    assert!(h.bus.published_on(Topic::Command).is_empty());
}

#[tokio::test]
async fn invalid_source_requests_shutdown() {
    let h = harness();
    let outcome = h.worker.run(&h.start, scripted(&[Bad, Bad, Bad])).await;

    assert_eq!(outcome, CaptureOutcome::InvalidSource { corrupted: 3 });
    assert!(h.blobs.objects_for(&h.start.request_uuid).is_empty());
    assert_shutdown_requested(&h);
}

#[tokio::test]
async fn unopenable_source_requests_shutdown() {
    let h = harness();
    let outcome = h
        .worker
        .run(&h.start, |_: &str, _| -> Result<ScriptedSource> {
            Err(Error::Process("connection refused".to_string()))
        })
        .await;

    assert!(matches!(outcome, CaptureOutcome::Failed(_)), "got {outcome:?}");
    assert_shutdown_requested(&h);
}

#[tokio::test]
async fn read_error_requests_shutdown() {
    let h = harness();
    let outcome = h.worker.run(&h.start, scripted(&[Good, Good, Broken])).await;

    assert!(matches!(outcome, CaptureOutcome::Failed(_)), "got {outcome:?}");
    assert_shutdown_requested(&h);
}

struct FullBlobStore;

#[async_trait]
impl BlobStore for FullBlobStore {
    async fn put_frame(&self, _: &RequestId, _: &Frame) -> Result<String> {
        Err(Error::Blob("bucket full".to_string()))
    }
    async fn get_frame(&self, _: &str) -> Result<Option<Frame>> {
        Ok(None)
    }
    async fn clear(&self, _: &RequestId) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn storage_failure_requests_shutdown() {
    let mut h = harness();
    h.worker = CaptureWorker::new(Arc::new(FullBlobStore), h.bus.clone(), settings());
    let outcome = h.worker.run(&h.start, scripted(&[Good; 5])).await;

    assert!(matches!(outcome, CaptureOutcome::Failed(_)), "got {outcome:?}");
    assert_shutdown_requested(&h);
}

#[test]
fn ffmpeg_source_rejects_empty_locator() {
    let result = FfmpegSource::open("  ", SHAPE);
    assert!(matches!(result, Err(Error::Process(_))));
}
