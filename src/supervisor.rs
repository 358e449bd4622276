//! Capture worker processes: spawn, registry, termination.
//!
//! The [`Supervisor`] owns the `{request_uuid -> worker handles}` registry.
//! Every mutation for a given request runs under that request's lock, so a
//! spawn+register can never interleave with a claim for the same request.
//! A watcher task per child reaps it and marks the handle stale, and
//! [`Supervisor::signal`] never sends to a stale pid.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::RequestId;
use crate::telemetry::metrics;

/// Starts the OS process that reads one stream.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, request: &RequestId, stream_source: &str) -> Result<Child>;
}

/// Re-executes a farseer binary as `farseer capture --request-uuid U --source S`.
#[derive(Debug, Clone)]
pub struct SelfExecLauncher {
    program: PathBuf,
}

impl SelfExecLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launcher for the currently running executable.
    pub fn current() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl WorkerLauncher for SelfExecLauncher {
    fn launch(&self, request: &RequestId, stream_source: &str) -> Result<Child> {
        let child = Command::new(&self.program)
            .arg("capture")
            .arg("--request-uuid")
            .arg(request.as_str())
            .arg("--source")
            .arg(stream_source)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn capture worker: {e}")))?;
        Ok(child)
    }
}

/// Launches a fixed command regardless of the request.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, _request: &RequestId, _stream_source: &str) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn {}: {e}", self.program.display())))
    }
}

// ---------------------------------------------------------------------------
// Per-key locks
// ---------------------------------------------------------------------------

/// One async mutex per key, created on demand.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<RequestId, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &RequestId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            // Nobody holds or waits on a lock whose only owner is the map.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Keys with a live lock.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A registered worker process.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub pid: u32,
    exited: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Has the process exited and been reaped? Its pid may then belong to
    /// something else.
    pub fn is_stale(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    registry: Mutex<HashMap<RequestId, Vec<WorkerHandle>>>,
    locks: KeyedLocks,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            registry: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Vec<WorkerHandle>>> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Spawn a worker for `request` and register it. Returns its pid.
    pub async fn spawn(&self, request: &RequestId, stream_source: &str) -> Result<u32> {
        let _guard = self.locks.lock(request).await;

        let mut child = match self.launcher.launch(request, stream_source) {
            Ok(child) => child,
            Err(e) => {
                metrics::workers_spawned().add(1, &[KeyValue::new("result", "error")]);
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            metrics::workers_spawned().add(1, &[KeyValue::new("result", "error")]);
            return Err(Error::Process(format!(
                "worker for {request} exited before reporting a pid"
            )));
        };

        let exited = Arc::new(AtomicBool::new(false));
        let watcher_flag = Arc::clone(&exited);
        let watched = request.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(request_uuid = %watched, pid, %status, "worker exited"),
                Err(e) => warn!(
                    request_uuid = %watched,
                    pid,
                    error = %e,
                    "failed to wait on worker"
                ),
            }
            watcher_flag.store(true, Ordering::SeqCst);
        });

        self.registry()
            .entry(request.clone())
            .or_default()
            .push(WorkerHandle { pid, exited });

        metrics::workers_spawned().add(1, &[KeyValue::new("result", "ok")]);
        info!(request_uuid = %request, pid, "worker spawned");
        Ok(pid)
    }

    /// Remove and return every handle registered for `request`.
    ///
    /// Empty when nothing is registered; exactly one of several concurrent
    /// claims gets the handles.
    pub async fn claim(&self, request: &RequestId) -> Vec<WorkerHandle> {
        let _guard = self.locks.lock(request).await;
        self.registry().remove(request).unwrap_or_default()
    }

    /// Send SIGTERM to every live handle. Returns how many were signalled.
    ///
    /// Delivery failures are logged and skipped.
    pub fn signal(&self, request: &RequestId, handles: &[WorkerHandle]) -> usize {
        let mut signalled = 0;
        for handle in handles {
            if handle.is_stale() {
                debug!(
                    request_uuid = %request,
                    pid = handle.pid,
                    "worker already exited, not signalling"
                );
                metrics::workers_signalled().add(1, &[KeyValue::new("result", "stale")]);
                continue;
            }
            let Ok(raw) = i32::try_from(handle.pid) else {
                warn!(request_uuid = %request, pid = handle.pid, "pid out of range");
                continue;
            };
            match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => {
                    signalled += 1;
                    metrics::workers_signalled().add(1, &[KeyValue::new("result", "ok")]);
                }
                Err(e) => {
                    warn!(
                        request_uuid = %request,
                        pid = handle.pid,
                        error = %e,
                        "failed to signal worker"
                    );
                    metrics::workers_signalled().add(1, &[KeyValue::new("result", "error")]);
                }
            }
        }
        info!(request_uuid = %request, signalled, registered = handles.len(), "workers signalled");
        signalled
    }

    /// Pids currently registered for `request`.
    pub fn pids(&self, request: &RequestId) -> Vec<u32> {
        self.registry()
            .get(request)
            .map(|handles| handles.iter().map(|h| h.pid).collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, request: &RequestId) -> bool {
        self.registry().contains_key(request)
    }

    /// Has every worker registered for `request` exited? `None` if unregistered.
    pub fn is_stale(&self, request: &RequestId) -> Option<bool> {
        self.registry()
            .get(request)
            .map(|handles| handles.iter().all(WorkerHandle::is_stale))
    }
}
