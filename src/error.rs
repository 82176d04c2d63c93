use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Errors returned by try-on client and flow operations.
#[derive(Error, Debug)]
pub enum TryOnError {
    /// A required input was missing or unusable. Never retried.
    #[error("{0}")]
    Validation(String),

    /// The backend returned a non-success HTTP status.
    #[error("{method} {path} failed: {status} {body}")]
    Http {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    /// The backend rejected the session (401/403). Never retried.
    #[error("Not authorized ({status}): {body}")]
    Auth { status: u16, body: String },

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// The response was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),

    /// The backend reported the task as failed or errored.
    #[error("{message}")]
    TaskFailed {
        message: String,
        debug: Option<Value>,
    },

    /// Polling exceeded its wall-clock or poll-count budget.
    #[error("Result polling timed out after {0:?}")]
    Timeout(Duration),

    /// The flow was cancelled by the user or superseded by a newer one.
    #[error("Cancelled by user")]
    Cancelled,

    /// Image decoding or encoding failed.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client configuration could not be resolved.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem error while reading inputs or writing downloads.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for TryOnError {
    fn from(err: anyhow::Error) -> Self {
        TryOnError::InvalidResponse(err.to_string())
    }
}

/// HTTP statuses treated as cold-start/availability failures.
pub(crate) const TRANSIENT_STATUSES: [u16; 4] = [404, 502, 503, 504];

impl TryOnError {
    /// Whether a submission that failed this way may be sent again.
    ///
    /// Only server-availability statuses and failures to connect qualify. A
    /// timeout or broken connection may have reached a server that already
    /// queued the job, so those are not resent.
    pub fn is_transient(&self) -> bool {
        match self {
            TryOnError::Http { status, .. } => TRANSIENT_STATUSES.contains(status),
            TryOnError::Network { source, .. } => source.is_connect(),
            _ => false,
        }
    }

    /// Whether the orchestrator's attempt loop should submit a fresh task
    /// after this error.
    pub fn is_retryable_attempt(&self) -> bool {
        match self {
            TryOnError::TaskFailed { .. } | TryOnError::InvalidResponse(_) => true,
            TryOnError::Http { status, .. } => *status >= 500 || TRANSIENT_STATUSES.contains(status),
            TryOnError::Network { .. } => true,
            _ => false,
        }
    }

    /// Structured debug detail attached by the backend, if any.
    pub fn debug(&self) -> Option<&Value> {
        match self {
            TryOnError::TaskFailed { debug, .. } => debug.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn from_status(method: &'static str, path: &str, status: u16, body: String) -> Self {
        if status == 401 || status == 403 {
            TryOnError::Auth { status, body }
        } else {
            TryOnError::Http {
                method,
                path: path.to_string(),
                status,
                body,
            }
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TryOnError>;
