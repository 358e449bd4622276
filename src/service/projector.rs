//! Projector: relays the durable log into the fast read store.
//!
//! Keeps a replay cursor (the last `event_id` written to the read store).
//! Each cycle reads the rows past the cursor in id order and, for each,
//! writes a last-write-wins snapshot: the row's state as the only flag plus
//! the labels cached for its request at that moment. Replaying rows is
//! harmless, so a cycle that fails part way simply resumes from the cursor.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, error};

use super::{RetryPolicy, ServiceConfig, supervise};
use crate::error::{Error, Result};
use crate::model::Projection;
use crate::store::{DetectionCache, EventLog, ProjectionStore};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

const SERVICE: &str = "projector";

#[derive(Debug, Clone, Copy)]
pub struct ProjectorConfig {
    pub interval: std::time::Duration,
    /// Rows fetched per query. Values below one are treated as one.
    pub batch: i64,
    pub retry: RetryPolicy,
}

impl From<&ServiceConfig> for ProjectorConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            interval: config.projection_interval,
            batch: config.projection_batch,
            retry: config.projector_retry,
        }
    }
}

#[derive(Clone)]
pub struct Projector {
    log: Arc<dyn EventLog>,
    cache: Arc<dyn DetectionCache>,
    store: Arc<dyn ProjectionStore>,
    config: ProjectorConfig,
    cursor: Arc<AtomicI64>,
    shutdown: Arc<Notify>,
}

impl Projector {
    pub fn new(
        log: Arc<dyn EventLog>,
        cache: Arc<dyn DetectionCache>,
        store: Arc<dyn ProjectionStore>,
        config: ProjectorConfig,
    ) -> Self {
        Self {
            log,
            cache,
            store,
            config,
            cursor: Arc::new(AtomicI64::new(0)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Last `event_id` written to the read store.
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Move the replay cursor, e.g. to replay a log segment.
    pub fn set_cursor(&self, event_id: i64) {
        self.cursor.store(event_id, Ordering::SeqCst);
    }

    /// Signal the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Project on a fixed interval until shutdown or the retry budget is spent.
    pub async fn run(&self) -> Result<()> {
        supervise(SERVICE, self.config.retry, &self.shutdown, || async {
            self.project_once().await?;
            tokio::time::sleep(self.config.interval).await;
            Ok::<_, Error>(())
        })
        .await
    }

    /// One cycle. Returns the number of rows projected.
    ///
    /// A failed log query skips the cycle and leaves the cursor alone. A
    /// failed cache read or store write ends the cycle with an error, the
    /// cursor pointing at the last row actually written.
    pub async fn project_once(&self) -> Result<usize> {
        let started = Instant::now();
        let batch = self.config.batch.max(1);
        let mut projected = 0;

        loop {
            let after = self.cursor();
            let rows = match self.log.events_since(after, batch).await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(cursor = after, error = %e, "failed to read event log, skipping cycle");
                    return Ok(projected);
                }
            };
            if rows.is_empty() {
                break;
            }
            let full_batch = rows.len() as i64 >= batch;

            for row in rows {
                let request = &row.event.request_uuid;
                let labels = self.cache.labels(request).await?;
                let projection = Projection::new(request.clone(), row.event.state, labels);
                self.store.put(&projection).await?;

                self.set_cursor(row.event_id);
                projected += 1;
                metrics::projections_written().add(1, &[]);
                debug!(
                    event_id = row.event_id,
                    request_uuid = %request,
                    state = row.event.state.map(|s| s.as_str()).unwrap_or(""),
                    "projection written"
                );
            }

            if !full_batch {
                break;
            }
        }

        if projected > 0 {
            metrics::operation_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "project")],
            );
        }
        Ok(projected)
    }
}
