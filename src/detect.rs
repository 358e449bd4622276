//! Object detection collaborator: a frame in, a list of labels out.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Frame;

#[async_trait]
pub trait Detector: Send + Sync {
    /// Labels of the objects found in `frame`, in the detector's order.
    async fn detect(&self, frame: &Frame) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    labels: Vec<String>,
}

/// Detection service reached over HTTP.
///
/// Posts the packed frame and its `h,w,c` shape as multipart form data to
/// `{base_url}/v1/detect` and expects `{"labels": [...]}` back.
#[derive(Debug, Clone)]
pub struct HttpDetector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDetector {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<String>> {
        let url = format!("{}/v1/detect", self.base_url);
        let form = Form::new()
            .part(
                "frame",
                Part::bytes(frame.data.to_vec())
                    .file_name("frame.rgb")
                    .mime_str("application/octet-stream")?,
            )
            .text("shape", frame.shape.to_string());

        let resp = self.client.post(&url).multipart(form).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Detection(format!(
                "detection request failed: {}",
                resp.status()
            )));
        }

        let result: DetectResponse = resp.json().await?;
        debug!(labels = result.labels.len(), "detection finished");
        Ok(result.labels)
    }
}
