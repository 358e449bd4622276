//! Runner: owns the capture worker of every active stream.
//!
//! `start` spawns and registers a worker before the next poll. `stop` and
//! the worker's own `invalid_source` share one shutdown sequence, run in the
//! background: claim the registration, announce the shutdown states, signal
//! the workers, clear stored frames, ask inference to drop cached labels,
//! and announce `inactive`. Without a registration nothing is published.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};

use super::{BackgroundTasks, RetryPolicy, supervise};
use crate::bus::{Bus, Delivery, Topic};
use crate::error::{Error, Result};
use crate::model::{Event, EventKind, LifecycleState};
use crate::store::BlobStore;
use crate::supervisor::Supervisor;
use crate::telemetry::event::start_event_span;

const SERVICE: &str = "runner";

#[derive(Clone)]
pub struct Runner {
    bus: Arc<dyn Bus>,
    supervisor: Arc<Supervisor>,
    blobs: Arc<dyn BlobStore>,
    poll_timeout: std::time::Duration,
    retry: RetryPolicy,
    shutdown: Arc<Notify>,
    tasks: Arc<BackgroundTasks>,
}

impl Runner {
    pub fn new(
        bus: Arc<dyn Bus>,
        supervisor: Arc<Supervisor>,
        blobs: Arc<dyn BlobStore>,
        poll_timeout: std::time::Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            supervisor,
            blobs,
            poll_timeout,
            retry,
            shutdown: Arc::new(Notify::new()),
            tasks: Arc::new(BackgroundTasks::new(SERVICE)),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Signal the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Consume commands until shutdown or the retry budget is spent.
    pub async fn run(&self) -> Result<()> {
        let result = supervise(SERVICE, self.retry, &self.shutdown, || self.poll_once()).await;
        self.tasks.drain().await;
        result
    }

    /// Wait for every shutdown sequence started so far.
    pub async fn settle(&self) {
        self.tasks.drain().await;
    }

    /// One iteration: take at most one command off the bus and handle it.
    pub async fn poll_once(&self) -> Result<()> {
        self.tasks.reap();
        match self.bus.consume(&[Topic::Command], self.poll_timeout).await {
            Ok(Delivery::NoMessage) => Ok(()),
            Ok(Delivery::Event { event, .. }) => {
                self.handle(event).await;
                Ok(())
            }
            Err(Error::MalformedPayload { topic, reason }) => {
                warn!(%topic, %reason, "skipping malformed command");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn handle(&self, event: Event) {
        debug!(request_uuid = %event.request_uuid, event = %event.event, "command received");
        match event.event {
            EventKind::Start => self.start(&event).await,
            EventKind::Stop | EventKind::InvalidSource => {
                let this = self.clone();
                let span = start_event_span(SERVICE, &event);
                self.tasks
                    .spawn(async move { this.stop(&event).await }.instrument(span));
            }
            ref other => {
                warn!(request_uuid = %event.request_uuid, event = %other, "runner ignores event");
            }
        }
    }

    async fn start(&self, event: &Event) {
        let request = &event.request_uuid;
        self.bus
            .announce(event, Topic::RunnerState, Some(LifecycleState::InStartupProcessing))
            .await;

        match self.supervisor.spawn(request, &event.stream_source).await {
            Ok(pid) => info!(request_uuid = %request, pid, "stream processing started"),
            Err(e) => {
                error!(request_uuid = %request, error = %e, "failed to start capture worker");
                let shut_down = event.derive(EventKind::ShutDown, event.stream_source.clone());
                self.bus
                    .announce(&shut_down, Topic::RunnerState, Some(LifecycleState::Inactive))
                    .await;
            }
        }
    }

    /// The shutdown sequence.
    async fn stop(&self, event: &Event) -> Result<()> {
        let request = &event.request_uuid;
        let handles = self.supervisor.claim(request).await;
        if handles.is_empty() {
            warn!(
                request_uuid = %request,
                event = %event.event,
                "no registered worker, nothing to stop"
            );
            return Ok(());
        }

        let shut_down = event.derive(EventKind::ShutDown, event.stream_source.clone());
        for state in [LifecycleState::InitShutdown, LifecycleState::InShutdownProcessing] {
            self.bus
                .announce(&shut_down, Topic::RunnerState, Some(state))
                .await;
        }

        self.supervisor.signal(request, &handles);

        if let Err(e) = self.blobs.clear(request).await {
            error!(request_uuid = %request, error = %e, "failed to clear stored frames");
        }

        let clean_up = event.derive(EventKind::CleanUp, event.stream_source.clone());
        self.bus.announce(&clean_up, Topic::Dispatch, None).await;

        self.bus
            .announce(&shut_down, Topic::RunnerState, Some(LifecycleState::Inactive))
            .await;

        info!(request_uuid = %request, workers = handles.len(), "stream stopped");
        Ok(())
    }
}
