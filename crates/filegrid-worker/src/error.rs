//! Worker error types.

use std::time::Duration;

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker call {method} failed: {message}")]
    Call { method: String, message: String },

    #[error("unknown worker method: {0}")]
    UnknownMethod(String),

    #[error("worker channel closed")]
    Closed,

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("worker unresponsive after {missed} missed pings")]
    Unresponsive { missed: u32 },

    #[error("invalid payload: {0}")]
    Payload(String),
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        WorkerError::Payload(e.to_string())
    }
}
