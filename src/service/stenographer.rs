//! Stenographer: writes every state announcement to the durable log.
//!
//! Writes run in the background, but writes for the same request are chained
//! so they reach the log in the order they were consumed. The latest-state
//! row therefore ends on the last observed state.

use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tracing::{Instrument, error, warn};

use super::{BackgroundTasks, RetryPolicy, supervise};
use crate::bus::{Bus, Delivery, Topic};
use crate::error::{Error, Result};
use crate::model::{Event, LifecycleState, RequestId};
use crate::store::EventLog;
use crate::telemetry::event::{record_state_transition, start_event_span};
use crate::telemetry::metrics;

const SERVICE: &str = "stenographer";

/// What happened to one event handed to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Recorded,
    /// Written, although the log's previous state does not lead to it.
    IllegalTransition,
    /// The log rejected the write.
    Failed,
}

impl WriteOutcome {
    /// Value of the `result` label on `farseer.event_log.writes`.
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOutcome::Recorded => "ok",
            WriteOutcome::IllegalTransition => "illegal_transition",
            WriteOutcome::Failed => "error",
        }
    }
}

/// Completion signal of the most recent write per request.
type Lanes = Mutex<HashMap<RequestId, oneshot::Receiver<()>>>;

#[derive(Clone)]
pub struct Stenographer {
    bus: Arc<dyn Bus>,
    log: Arc<dyn EventLog>,
    poll_timeout: Duration,
    retry: RetryPolicy,
    lanes: Arc<Lanes>,
    shutdown: Arc<Notify>,
    tasks: Arc<BackgroundTasks>,
}

impl Stenographer {
    pub fn new(
        bus: Arc<dyn Bus>,
        log: Arc<dyn EventLog>,
        poll_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            log,
            poll_timeout,
            retry,
            lanes: Arc::new(Mutex::new(HashMap::new())),
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

    /// Wait for every write started so far.
    pub async fn settle(&self) {
        self.tasks.drain().await;
    }

    pub async fn poll_once(&self) -> Result<()> {
        self.tasks.reap();
        match self.bus.consume(&Topic::STATE_TOPICS, self.poll_timeout).await {
            Ok(Delivery::NoMessage) => Ok(()),
            Ok(Delivery::Event { event, .. }) => {
                self.handle(event);
                Ok(())
            }
            Err(Error::MalformedPayload { topic, reason }) => {
                warn!(%topic, %reason, "skipping malformed state event");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Queue `event` for writing behind earlier writes for the same request.
    pub fn handle(&self, event: Event) {
        let (done, finished) = oneshot::channel();
        let previous = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
            // Lanes whose last write completed (or died) are no longer needed.
            lanes.retain(|_, rx| {
                matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty))
            });
            lanes.insert(event.request_uuid.clone(), finished)
        };

        let this = self.clone();
        let span = start_event_span(SERVICE, &event);
        self.tasks.spawn(
            async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                this.write(&event).await;
                let _ = done.send(());
                Ok(())
            }
            .instrument(span),
        );
    }

    /// Record `event` in the log now, bypassing the per-request lanes.
    ///
    /// Failures are logged and reported in the outcome, never retried.
    pub async fn write(&self, event: &Event) -> WriteOutcome {
        let outcome = self.record(event).await;
        metrics::event_log_writes().add(1, &[KeyValue::new("result", outcome.as_str())]);
        outcome
    }

    async fn record(&self, event: &Event) -> WriteOutcome {
        let request = &event.request_uuid;
        let recorded = match self.log.record(event).await {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(
                    request_uuid = %request,
                    event = %event.event,
                    error = %e,
                    "failed to record event"
                );
                return WriteOutcome::Failed;
            }
        };

        let Some(state) = event.state else {
            return WriteOutcome::Recorded;
        };

        let from = recorded.previous.unwrap_or(LifecycleState::Unstarted);
        if from.can_transition_to(state) {
            record_state_transition(&tracing::Span::current(), recorded.previous, state);
            WriteOutcome::Recorded
        } else {
            warn!(
                request_uuid = %request,
                event_id = recorded.event_id,
                from = %from,
                to = %state,
                "illegal lifecycle transition recorded"
            );
            WriteOutcome::IllegalTransition
        }
    }
}
