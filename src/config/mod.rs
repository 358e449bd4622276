//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use crate::capture::CaptureSettings;
use crate::error::{Error, Result};
use crate::model::FrameShape;
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;

/// Default blob store bucket.
pub const DEFAULT_BUCKET: &str = "frames-for-inference";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Root directory of the file blob store.
    pub blob_root: PathBuf,
    pub blob_bucket: String,
    /// Detection service base URL. Only inference needs it.
    pub detector_url: Option<String>,
    pub capture: CaptureSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let width = parsed_var("FRAME_WIDTH", 640u32)?;
        let height = parsed_var("FRAME_HEIGHT", 480u32)?;
        let capture = CaptureSettings::new(
            FrameShape::rgb(width, height),
            parsed_var("SAMPLING_WINDOW", 100u32)?,
            parsed_var("INVALID_FRAME_THRESHOLD", 50u32)?,
        )?;

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            blob_root: std::env::var("BLOB_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("farseer-blobs")),
            blob_bucket: std::env::var("BLOB_BUCKET")
                .unwrap_or_else(|_| DEFAULT_BUCKET.to_string()),
            detector_url: std::env::var("DETECTOR_URL").ok().filter(|u| !u.is_empty()),
            capture,
        })
    }

    /// The detection service URL, or a config error naming the missing var.
    pub fn require_detector_url(&self) -> Result<&str> {
        self.detector_url.as_deref().ok_or_else(|| {
            Error::Config("required environment variable DETECTOR_URL is not set".to_string())
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(_) => Ok(default),
    }
}
