//! Inference: runs detection on dispatched samples and accumulates labels.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{Instrument, debug, info, warn};

use super::{BackgroundTasks, RetryPolicy, supervise};
use crate::bus::{Bus, Delivery, Topic};
use crate::detect::Detector;
use crate::error::{Error, Result};
use crate::model::{Event, EventKind, LifecycleState};
use crate::store::{BlobStore, DetectionCache};
use crate::telemetry::event::start_event_span;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

const SERVICE: &str = "inference";

#[derive(Clone)]
pub struct Inference {
    bus: Arc<dyn Bus>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<dyn DetectionCache>,
    detector: Arc<dyn Detector>,
    poll_timeout: Duration,
    retry: RetryPolicy,
    shutdown: Arc<Notify>,
    tasks: Arc<BackgroundTasks>,
}

impl Inference {
    pub fn new(
        bus: Arc<dyn Bus>,
        blobs: Arc<dyn BlobStore>,
        cache: Arc<dyn DetectionCache>,
        detector: Arc<dyn Detector>,
        poll_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            blobs,
            cache,
            detector,
            poll_timeout,
            retry,
            shutdown: Arc::new(Notify::new()),
            tasks: Arc::new(BackgroundTasks::new(SERVICE)),
        }
    }

    /// Signal the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn run(&self) -> Result<()> {
        let result = supervise(SERVICE, self.retry, &self.shutdown, || self.poll_once()).await;
        self.tasks.drain().await;
        result
    }

    /// Wait for every detection and clean-up started so far.
    pub async fn settle(&self) {
        self.tasks.drain().await;
    }

    pub async fn poll_once(&self) -> Result<()> {
        self.tasks.reap();
        match self.bus.consume(&[Topic::Dispatch], self.poll_timeout).await {
            Ok(Delivery::NoMessage) => Ok(()),
            Ok(Delivery::Event { event, .. }) => {
                self.handle(event).await;
                Ok(())
            }
            Err(Error::MalformedPayload { topic, reason }) => {
                warn!(%topic, %reason, "skipping malformed dispatch");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn handle(&self, event: Event) {
        let span = start_event_span(SERVICE, &event);
        match event.event {
            EventKind::Predict => {
                self.bus
                    .announce(&event, Topic::InferenceState, Some(LifecycleState::Active))
                    .await;
                let this = self.clone();
                self.tasks
                    .spawn(async move { this.predict(&event).await }.instrument(span));
            }
            EventKind::CleanUp => {
                let this = self.clone();
                self.tasks
                    .spawn(async move { this.clean_up(&event).await }.instrument(span));
            }
            ref other => {
                warn!(
                    request_uuid = %event.request_uuid,
                    event = %other,
                    "inference ignores event"
                );
            }
        }
    }

    async fn predict(&self, event: &Event) -> Result<()> {
        let request = &event.request_uuid;
        let Some(frame) = self.blobs.get_frame(&event.stream_source).await? else {
            debug!(
                request_uuid = %request,
                frame_id = %event.stream_source,
                "frame already removed, skipping"
            );
            return Ok(());
        };

        let started = Instant::now();
        let labels = self.detector.detect(&frame).await?;
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "detect")],
        );

        let stored = self.cache.append(request, &labels).await?;
        metrics::detections().add(stored as u64, &[]);
        info!(request_uuid = %request, detected = labels.len(), stored, "detections cached");
        Ok(())
    }

    async fn clean_up(&self, event: &Event) -> Result<()> {
        let removed = self.cache.clear(&event.request_uuid).await?;
        info!(request_uuid = %event.request_uuid, removed, "detection cache cleared");
        Ok(())
    }
}
