//! Error types for farseer-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed payload on {topic}: {reason}")]
    MalformedPayload { topic: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown lifecycle state: {0}")]
    UnknownState(String),

    #[error("blob store error: {0}")]
    Blob(String),

    #[error("detection error: {0}")]
    Detection(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{service} exhausted its retry budget")]
    RetryBudgetExhausted { service: String },

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Detection(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
