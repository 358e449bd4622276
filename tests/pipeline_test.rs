//! End to end on the in-memory backends: ingress, runner, capture worker,
//! inference, stenographer and projector wired over one bus.

use async_trait::async_trait;
use farseer_rs::bus::{MemoryBus, Topic};
use farseer_rs::capture::{CaptureOutcome, CaptureSettings, CaptureWorker, FrameSource};
use farseer_rs::detect::Detector;
use farseer_rs::error::Result;
use farseer_rs::model::{Event, EventKind, Frame, FrameShape, LifecycleState, RequestId};
use farseer_rs::service::{
    Command, Inference, Ingress, Projector, ProjectorConfig, RetryPolicy, Runner, ServiceConfig,
    Stenographer,
};
use farseer_rs::store::{
    DetectionCache, MemoryBlobStore, MemoryDetectionCache, MemoryEventLog,
    MemoryProjectionStore, query_projection,
};
use farseer_rs::supervisor::{CommandLauncher, Supervisor};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;

const SHAPE: FrameShape = FrameShape {
    height: 4,
    width: 4,
    channels: 3,
};

/// Good frames forever, or nothing but failed reads.
struct SyntheticStream {
    healthy: bool,
}

#[async_trait]
impl FrameSource for SyntheticStream {
    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        if self.healthy {
            Ok(Some(Frame::new(SHAPE, vec![128u8; SHAPE.byte_len()])))
        } else {
            Ok(None)
        }
    }
}

struct SeesPeopleAndCars;

#[async_trait]
impl Detector for SeesPeopleAndCars {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<String>> {
        Ok(vec!["person".to_string(), "car".to_string()])
    }
}

struct System {
    bus: Arc<MemoryBus>,
    blobs: Arc<MemoryBlobStore>,
    cache: Arc<MemoryDetectionCache>,
    log: Arc<MemoryEventLog>,
    store: Arc<MemoryProjectionStore>,
    ingress: Ingress,
    runner: Runner,
    inference: Inference,
    stenographer: Stenographer,
    projector: Projector,
    worker: CaptureWorker,
}

impl System {
    fn new() -> Self {
        let bus = Arc::new(MemoryBus::new());
        let blobs = Arc::new(MemoryBlobStore::new("frames"));
        let cache = Arc::new(MemoryDetectionCache::new());
        let log = Arc::new(MemoryEventLog::new());
        let store = Arc::new(MemoryProjectionStore::new());

        let poll = Duration::from_millis(20);
        let retry = RetryPolicy::new(3, Duration::from_millis(10));
        let supervisor = Arc::new(Supervisor::new(Arc::new(
            CommandLauncher::new("sleep").arg("30"),
        )));

        let mut tuning = ServiceConfig::default();
        tuning.projection_interval = Duration::from_millis(10);

        Self {
            ingress: Ingress::new(bus.clone()),
            runner: Runner::new(bus.clone(), supervisor, blobs.clone(), poll, retry),
            inference: Inference::new(
                bus.clone(),
                blobs.clone(),
                cache.clone(),
                Arc::new(SeesPeopleAndCars),
                poll,
                retry,
            ),
            stenographer: Stenographer::new(bus.clone(), log.clone(), poll, retry),
            projector: Projector::new(
                log.clone(),
                cache.clone(),
                store.clone(),
                ProjectorConfig::from(&tuning),
            ),
            worker: CaptureWorker::new(
                blobs.clone(),
                bus.clone(),
                CaptureSettings::new(SHAPE, 10, 5).unwrap(),
            ),
            bus,
            blobs,
            cache,
            log,
            store,
        }
    }

    /// Run the runner's loop until its topic is empty.
    async fn pump_runner(&self) {
        while self.bus.pending(Topic::Command) > 0 {
            self.runner.poll_once().await.unwrap();
        }
        self.runner.settle().await;
    }

    async fn pump_inference(&self) {
        while self.bus.pending(Topic::Dispatch) > 0 {
            self.inference.poll_once().await.unwrap();
        }
        self.inference.settle().await;
    }

    async fn pump_stenographer(&self) {
        while Topic::STATE_TOPICS
            .iter()
            .any(|&topic| self.bus.pending(topic) > 0)
        {
            self.stenographer.poll_once().await.unwrap();
        }
        self.stenographer.settle().await;
    }

    /// What the capture worker process would do for `request`.
    async fn capture(&self, request: &RequestId, healthy: bool) -> CaptureOutcome {
        let start = Event::new(EventKind::Start, request.clone(), "rtsp://camera/1");
        self.worker
            .run(&start, |_: &str, _| Ok(SyntheticStream { healthy }))
            .await
    }

    fn logged_states(&self, request: &RequestId) -> Vec<LifecycleState> {
        self.log
            .rows()
            .into_iter()
            .filter(|row| &row.event.request_uuid == request)
            .filter_map(|row| row.event.state)
            .collect()
    }
}

#[tokio::test]
async fn stream_lifecycle_from_start_to_inactive() {
    let system = System::new();

    let request = system
        .ingress
        .submit(Command::Start {
            stream_source: "rtsp://camera/1".to_string(),
            request_uuid: None,
        })
        .await
        .unwrap();
    assert!(!request.is_invalid());

    system.pump_runner().await;
    let pid = system.runner.supervisor().pids(&request)[0];

    let outcome = system.capture(&request, true).await;
    assert!(matches!(outcome, CaptureOutcome::Sampled { .. }));

    system.pump_inference().await;
    system.pump_stenographer().await;
    system.projector.project_once().await.unwrap();

    let record = query_projection(system.store.as_ref(), &request)
        .await
        .unwrap();
    assert_eq!(record.state(), Some(LifecycleState::Active));
    assert_eq!(record.active, "1");
    assert_eq!(record.detected_objects, ["person", "car"]);

    let stopped = system
        .ingress
        .submit(Command::Stop {
            request_uuid: Some(request.clone()),
        })
        .await
        .unwrap();
    assert_eq!(stopped, request);

    system.pump_runner().await;
    system.pump_inference().await;
    system.pump_stenographer().await;
    system.projector.project_once().await.unwrap();

    let record = query_projection(system.store.as_ref(), &request)
        .await
        .unwrap();
    assert_eq!(record.state(), Some(LifecycleState::Inactive));
    assert_eq!(record.active, "0");

    use LifecycleState::*;
    assert_eq!(
        system.logged_states(&request),
        [
            InitStartup,
            InStartupProcessing,
            Active,
            InitShutdown,
            InShutdownProcessing,
            Inactive,
        ]
    );

    assert!(!system.runner.supervisor().is_registered(&request));
    assert!(system.blobs.objects_for(&request).is_empty());
    assert!(system.cache.labels(&request).await.unwrap().is_empty());

    let mut alive = true;
    for _ in 0..200 {
        if kill(Pid::from_raw(pid as i32), None).is_err() {
            alive = false;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(!alive, "capture worker {pid} survived the stop");
}

#[tokio::test]
async fn corrupted_stream_shuts_itself_down() {
    let system = System::new();

    let request = system
        .ingress
        .submit(Command::Start {
            stream_source: "rtsp://camera/broken".to_string(),
            request_uuid: None,
        })
        .await
        .unwrap();
    system.pump_runner().await;

    let outcome = system.capture(&request, false).await;
    assert_eq!(outcome, CaptureOutcome::InvalidSource { corrupted: 5 });

    system.pump_runner().await;
    system.pump_inference().await;
    system.pump_stenographer().await;
    system.projector.project_once().await.unwrap();

    let record = query_projection(system.store.as_ref(), &request)
        .await
        .unwrap();
    assert_eq!(record.state(), Some(LifecycleState::Inactive));
    assert!(record.detected_objects.is_empty());

    use LifecycleState::*;
    assert_eq!(
        system.logged_states(&request),
        [
            InitStartup,
            InStartupProcessing,
            InitShutdown,
            InShutdownProcessing,
            Inactive,
        ]
    );
    assert!(!system.runner.supervisor().is_registered(&request));
}
