//! Runner: start spawns and registers a worker; stop and invalid_source run
//! the shutdown sequence; unknown stops are silent.

use farseer_rs::bus::{Bus, MemoryBus, Topic};
use farseer_rs::model::{Event, EventKind, Frame, FrameShape, LifecycleState, RequestId};
use farseer_rs::service::{RetryPolicy, Runner};
use farseer_rs::store::{BlobStore, MemoryBlobStore};
use farseer_rs::supervisor::{CommandLauncher, Supervisor, WorkerLauncher};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    bus: Arc<MemoryBus>,
    blobs: Arc<MemoryBlobStore>,
    runner: Runner,
}

fn harness_with(launcher: impl WorkerLauncher + 'static) -> Harness {
    let bus = Arc::new(MemoryBus::new());
    let blobs = Arc::new(MemoryBlobStore::new("frames"));
    let supervisor = Arc::new(Supervisor::new(Arc::new(launcher)));
    let runner = Runner::new(
        bus.clone(),
        supervisor,
        blobs.clone(),
        Duration::from_millis(20),
        RetryPolicy::new(3, Duration::from_millis(10)),
    );
    Harness { bus, blobs, runner }
}

fn harness() -> Harness {
    harness_with(CommandLauncher::new("sleep").arg("30"))
}

fn start(request: &RequestId) -> Event {
    Event::new(EventKind::Start, request.clone(), "rtsp://camera/1")
        .announcing(Some(LifecycleState::InitStartup))
}

fn stop(request: &RequestId) -> Event {
    Event::new(EventKind::Stop, request.clone(), "").announcing(Some(LifecycleState::InitShutdown))
}

fn runner_states(bus: &MemoryBus, request: &RequestId) -> Vec<(EventKind, Option<LifecycleState>)> {
    bus.published_on(Topic::RunnerState)
        .into_iter()
        .filter(|e| &e.request_uuid == request)
        .map(|e| (e.event, e.state))
        .collect()
}

fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_announces_and_registers_one_worker() {
    let h = harness();
    let request = RequestId::new();

    h.runner.handle(start(&request)).await;

    assert_eq!(
        runner_states(&h.bus, &request),
        [(EventKind::Start, Some(LifecycleState::InStartupProcessing))]
    );
    let pids = h.runner.supervisor().pids(&request);
    assert_eq!(pids.len(), 1);
    assert!(pid_alive(pids[0]));

    h.runner.handle(stop(&request)).await;
    h.runner.settle().await;
}

#[tokio::test]
async fn spawn_failure_ends_inactive() {
    let h = harness_with(CommandLauncher::new("/nonexistent/farseer-capture-worker"));
    let request = RequestId::new();

    h.runner.handle(start(&request)).await;

    assert_eq!(
        runner_states(&h.bus, &request),
        [
            (EventKind::Start, Some(LifecycleState::InStartupProcessing)),
            (EventKind::ShutDown, Some(LifecycleState::Inactive)),
        ]
    );
    assert!(!h.runner.supervisor().is_registered(&request));
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_runs_the_full_shutdown_sequence() {
    let h = harness();
    let request = RequestId::new();
    let other = RequestId::new();
    let shape = FrameShape::rgb(2, 2);
    h.blobs
        .put_frame(&request, &Frame::new(shape, vec![0u8; shape.byte_len()]))
        .await
        .unwrap();
    h.blobs
        .put_frame(&other, &Frame::new(shape, vec![0u8; shape.byte_len()]))
        .await
        .unwrap();

    h.runner.handle(start(&request)).await;
    let pid = h.runner.supervisor().pids(&request)[0];

    h.runner.handle(stop(&request)).await;
    h.runner.settle().await;

    assert_eq!(
        runner_states(&h.bus, &request),
        [
            (EventKind::Start, Some(LifecycleState::InStartupProcessing)),
            (EventKind::ShutDown, Some(LifecycleState::InitShutdown)),
            (EventKind::ShutDown, Some(LifecycleState::InShutdownProcessing)),
            (EventKind::ShutDown, Some(LifecycleState::Inactive)),
        ]
    );

    let dispatched = h.bus.published_on(Topic::Dispatch);
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].event, EventKind::CleanUp);
    assert_eq!(dispatched[0].request_uuid, request);

    assert!(!h.runner.supervisor().is_registered(&request));
    assert!(h.blobs.objects_for(&request).is_empty());
    assert_eq!(h.blobs.objects_for(&other).len(), 1);
    assert!(wait_until(|| !pid_alive(pid)).await, "worker {pid} still alive");
}

#[tokio::test]
async fn invalid_source_converges_on_the_same_sequence() {
    let h = harness();
    let request = RequestId::new();

    h.runner.handle(start(&request)).await;
    let invalid = Event::new(EventKind::InvalidSource, request.clone(), "rtsp://camera/1")
        .announcing(Some(LifecycleState::InitShutdown));
    h.runner.handle(invalid).await;
    h.runner.settle().await;

    let states: Vec<_> = runner_states(&h.bus, &request)
        .into_iter()
        .map(|(_, state)| state)
        .collect();
    assert_eq!(
        states,
        [
            Some(LifecycleState::InStartupProcessing),
            Some(LifecycleState::InitShutdown),
            Some(LifecycleState::InShutdownProcessing),
            Some(LifecycleState::Inactive),
        ]
    );
    assert!(!h.runner.supervisor().is_registered(&request));
}

#[tokio::test]
async fn stop_for_unknown_request_is_silent() {
    let h = harness();
    let request = RequestId::new();

    h.runner.handle(stop(&request)).await;
    h.runner.settle().await;

    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn second_stop_is_silent() {
    let h = harness();
    let request = RequestId::new();

    h.runner.handle(start(&request)).await;
    h.runner.handle(stop(&request)).await;
    h.runner.settle().await;
    let after_first = h.bus.published().len();

    h.runner.handle(stop(&request)).await;
    h.runner.settle().await;
    assert_eq!(h.bus.published().len(), after_first);
}

#[tokio::test]
async fn other_events_are_ignored() {
    let h = harness();
    let request = RequestId::new();

    h.runner
        .handle(Event::new(EventKind::Predict, request.clone(), "frames/x/y"))
        .await;
    h.runner.settle().await;

    assert!(h.bus.published().is_empty());
    assert!(!h.runner.supervisor().is_registered(&request));
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poll_once_consumes_commands_from_the_bus() {
    let h = harness();
    let request = RequestId::new();
    h.bus
        .publish(&start(&request), Topic::Command, Some(LifecycleState::InitStartup))
        .await
        .unwrap();

    h.runner.poll_once().await.unwrap();
    assert_eq!(h.runner.supervisor().pids(&request).len(), 1);

    h.bus
        .publish(&stop(&request), Topic::Command, Some(LifecycleState::InitShutdown))
        .await
        .unwrap();
    h.runner.poll_once().await.unwrap();
    h.runner.settle().await;
    assert!(!h.runner.supervisor().is_registered(&request));
}

#[tokio::test]
async fn malformed_commands_do_not_fail_the_loop() {
    let h = harness();
    h.bus
        .push_raw(Topic::Command, serde_json::json!({"event": "start"}));

    h.runner.poll_once().await.unwrap();
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let h = harness();
    let runner = h.runner.clone();
    let task = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.runner.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
