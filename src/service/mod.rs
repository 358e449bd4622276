//! Long-running services and the loop machinery they share.
//!
//! Every service polls with a short timeout, handles at most one message per
//! iteration and pushes slow work into [`BackgroundTasks`]. [`supervise`]
//! wraps the iteration in a bounded retry policy: each failure counts
//! against a fixed budget and is followed by a fixed delay, and an exhausted
//! budget stops the service for good.

pub mod inference;
pub mod ingress;
pub mod projector;
pub mod runner;
pub mod stenographer;

pub use inference::Inference;
pub use ingress::{Command, Ingress};
pub use projector::{Projector, ProjectorConfig};
pub use runner::Runner;
pub use stenographer::{Stenographer, WriteOutcome};

use opentelemetry::KeyValue;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// How many failed iterations a service tolerates, and the pause after each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub budget: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(budget: u32, delay: Duration) -> Self {
        Self { budget, delay }
    }
}

/// Loop tuning for every service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long one consume call blocks.
    pub poll_timeout: Duration,
    pub runner_retry: RetryPolicy,
    pub inference_retry: RetryPolicy,
    pub stenographer_retry: RetryPolicy,
    pub projector_retry: RetryPolicy,
    /// Pause between projector cycles.
    pub projection_interval: Duration,
    /// Log rows fetched per projector query.
    pub projection_batch: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            runner_retry: RetryPolicy::new(50, Duration::from_secs(2)),
            inference_retry: RetryPolicy::new(10, Duration::from_secs(2)),
            stenographer_retry: RetryPolicy::new(10, Duration::from_secs(2)),
            projector_retry: RetryPolicy::new(10, Duration::from_secs(2)),
            projection_interval: Duration::from_secs(2),
            projection_batch: 500,
        }
    }
}

/// Run `step` until `shutdown` fires or the retry budget is spent.
///
/// A shutdown interrupts a step in flight. Returns
/// [`Error::RetryBudgetExhausted`] once `policy.budget` iterations have failed.
pub async fn supervise<F, Fut>(
    service: &str,
    policy: RetryPolicy,
    shutdown: &Notify,
    mut step: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failures = 0u32;
    info!(service, "service started");

    loop {
        let outcome = tokio::select! {
            _ = shutdown.notified() => {
                info!(service, "service shutting down");
                return Ok(());
            }
            outcome = step() => outcome,
        };

        let Err(e) = outcome else { continue };

        failures += 1;
        metrics::service_failures().add(1, &[KeyValue::new("service", service.to_string())]);
        error!(service, failures, budget = policy.budget, error = %e, "service iteration failed");

        if failures >= policy.budget {
            warn!(service, failures, "retry budget exhausted, service stops");
            return Err(Error::RetryBudgetExhausted {
                service: service.to_string(),
            });
        }

        tokio::select! {
            _ = shutdown.notified() => {
                info!(service, "service shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

/// Detached tasks owned by one service.
///
/// Finished tasks are reaped on every loop iteration so that failures and
/// panics show up in the log. Nothing is dropped silently.
pub struct BackgroundTasks {
    service: &'static str,
    set: Mutex<JoinSet<Result<()>>>,
}

impl BackgroundTasks {
    pub fn new(service: &'static str) -> Self {
        Self {
            service,
            set: Mutex::new(JoinSet::new()),
        }
    }

    fn set(&self) -> std::sync::MutexGuard<'_, JoinSet<Result<()>>> {
        self.set.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.set().spawn(task);
    }

    /// Collect finished tasks without waiting. Returns how many were collected.
    pub fn reap(&self) -> usize {
        let mut set = self.set();
        let mut reaped = 0;
        while let Some(joined) = set.try_join_next() {
            self.report(joined);
            reaped += 1;
        }
        reaped
    }

    /// Wait for every task spawned so far.
    pub async fn drain(&self) {
        let mut set = std::mem::take(&mut *self.set());
        while let Some(joined) = set.join_next().await {
            self.report(joined);
        }
    }

    /// Tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.set().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn report(&self, joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(service = self.service, error = %e, "background task failed"),
            Err(e) if e.is_panic() => error!(service = self.service, "background task panicked"),
            Err(e) => warn!(service = self.service, error = %e, "background task cancelled"),
        }
    }
}
