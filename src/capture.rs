//! Capture worker: reads one stream, stores one sampled frame, requests
//! detection.
//!
//! This runs inside the per-stream worker process. A run counts good and
//! corrupted reads. When `sampling_window` good frames have been read, the
//! last one is stored and a `predict` event is dispatched, and the run
//! ends. When `invalid_frame_threshold` reads have failed first, the worker
//! asks the runner to shut the stream down by publishing `invalid_source`.
//! Failures to open or read the source end the same way.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, Topic};
use crate::error::{Error, Result};
use crate::model::{Event, EventKind, Frame, FrameShape, LifecycleState};
use crate::store::BlobStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Sampling parameters for one worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Decoded frame size requested from the source.
    pub shape: FrameShape,
    /// Good frames read before one is sampled.
    pub sampling_window: u32,
    /// Corrupted reads tolerated before the source is declared invalid.
    pub invalid_frame_threshold: u32,
}

impl CaptureSettings {
    pub fn new(
        shape: FrameShape,
        sampling_window: u32,
        invalid_frame_threshold: u32,
    ) -> Result<Self> {
        if sampling_window == 0 || invalid_frame_threshold == 0 {
            return Err(Error::Config(
                "sampling window and invalid frame threshold must be positive".to_string(),
            ));
        }
        if invalid_frame_threshold >= sampling_window {
            return Err(Error::Config(format!(
                "invalid frame threshold ({invalid_frame_threshold}) must be less than \
                 the sampling window ({sampling_window})"
            )));
        }
        Ok(Self {
            shape,
            sampling_window,
            invalid_frame_threshold,
        })
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            shape: FrameShape::rgb(640, 480),
            sampling_window: 100,
            invalid_frame_threshold: 50,
        }
    }
}

/// A decoded video stream.
#[async_trait]
pub trait FrameSource: Send {
    /// Read the next frame. `Ok(None)` is a failed (corrupted or missing)
    /// read; `Err` means the source itself broke.
    async fn read_frame(&mut self) -> Result<Option<Frame>>;
}

/// Decodes a stream with an `ffmpeg` child process into packed RGB frames.
pub struct FfmpegSource {
    // Dropping the child kills ffmpeg.
    _child: Child,
    stdout: ChildStdout,
    shape: FrameShape,
}

impl FfmpegSource {
    pub fn open(stream_source: &str, shape: FrameShape) -> Result<Self> {
        if stream_source.trim().is_empty() {
            return Err(Error::Process("empty stream source".to_string()));
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-loglevel", "error"]);
        if stream_source.starts_with("rtsp://") {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        let mut child = cmd
            .args(["-i", stream_source])
            .args(["-vf", &format!("scale={}:{}", shape.width, shape.height)])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("ffmpeg spawn failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("ffmpeg stdout not captured".to_string()))?;

        debug!(stream_source, %shape, "stream opened");
        Ok(Self {
            _child: child,
            stdout,
            shape,
        })
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = vec![0u8; self.shape.byte_len()];
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => Ok(Some(Frame::new(self.shape, buf))),
            // Closed pipe or truncated frame.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// How a sampling pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    Frame(Frame),
    Invalid { corrupted: u32 },
}

/// Read from `source` until a frame is sampled or the source is declared invalid.
pub async fn sample<S: FrameSource + ?Sized>(
    source: &mut S,
    settings: &CaptureSettings,
) -> Result<Sample> {
    let mut corrupted = 0u32;
    let mut frames = 0u32;
    loop {
        match source.read_frame().await? {
            None => {
                corrupted += 1;
                if corrupted >= settings.invalid_frame_threshold {
                    return Ok(Sample::Invalid { corrupted });
                }
            }
            Some(frame) => {
                frames += 1;
                if frames >= settings.sampling_window {
                    return Ok(Sample::Frame(frame));
                }
            }
        }
    }
}

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A frame was stored and dispatched for detection.
    Sampled { frame_id: String },
    /// Too many corrupted reads; shutdown was requested.
    InvalidSource { corrupted: u32 },
    /// The source or the blob store failed; shutdown was requested.
    Failed(String),
}

/// The body of a capture worker process.
pub struct CaptureWorker {
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn Bus>,
    settings: CaptureSettings,
}

impl CaptureWorker {
    pub fn new(blobs: Arc<dyn BlobStore>, bus: Arc<dyn Bus>, settings: CaptureSettings) -> Self {
        Self {
            blobs,
            bus,
            settings,
        }
    }

    /// Open the stream named by `start` with `open`, then run one sampling pass.
    pub async fn run<S, F>(&self, start: &Event, open: F) -> CaptureOutcome
    where
        S: FrameSource,
        F: FnOnce(&str, FrameShape) -> Result<S>,
    {
        let request = &start.request_uuid;
        let started = Instant::now();

        let mut source = match open(&start.stream_source, self.settings.shape) {
            Ok(source) => source,
            Err(e) => {
                error!(
                    request_uuid = %request,
                    stream_source = %start.stream_source,
                    error = %e,
                    "failed to open stream"
                );
                self.request_shutdown(start).await;
                return CaptureOutcome::Failed(e.to_string());
            }
        };

        let outcome = match sample(&mut source, &self.settings).await {
            Ok(Sample::Frame(frame)) => self.dispatch(start, &frame).await,
            Ok(Sample::Invalid { corrupted }) => {
                warn!(
                    request_uuid = %request,
                    corrupted,
                    "stream reading stopped: invalid stream source"
                );
                self.request_shutdown(start).await;
                CaptureOutcome::InvalidSource { corrupted }
            }
            Err(e) => {
                error!(request_uuid = %request, error = %e, "stream reading failed");
                self.request_shutdown(start).await;
                CaptureOutcome::Failed(e.to_string())
            }
        };

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "capture")],
        );
        outcome
    }

    async fn dispatch(&self, start: &Event, frame: &Frame) -> CaptureOutcome {
        let request = &start.request_uuid;
        let frame_id = match self.blobs.put_frame(request, frame).await {
            Ok(id) => id,
            Err(e) => {
                error!(request_uuid = %request, error = %e, "failed to store sampled frame");
                self.request_shutdown(start).await;
                return CaptureOutcome::Failed(e.to_string());
            }
        };

        let predict = start.derive(EventKind::Predict, frame_id.clone());
        self.bus
            .announce(&predict, Topic::Dispatch, Some(LifecycleState::Active))
            .await;
        info!(request_uuid = %request, %frame_id, "sample dispatched for detection");
        CaptureOutcome::Sampled { frame_id }
    }

    /// Ask the runner to run the shutdown sequence for this stream.
    async fn request_shutdown(&self, start: &Event) {
        let invalid = start.derive(EventKind::InvalidSource, start.stream_source.clone());
        self.bus
            .announce(&invalid, Topic::Command, Some(LifecycleState::InitShutdown))
            .await;
    }
}
