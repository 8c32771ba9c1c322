//! Scheduler error types.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::error;

use filegrid_core::WorkerId;
use filegrid_lock::LockError;
use filegrid_worker::WorkerError;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("{path} is {size} bytes, over the project limit of {max} bytes")]
    SizeLimitExceeded { path: String, size: u64, max: u64 },

    #[error("no file stats for {path}")]
    StatsUnavailable { path: String },

    #[error("worker {worker_id} failed to spawn: {source}")]
    WorkerSpawnFailure {
        worker_id: WorkerId,
        source: WorkerError,
    },

    #[error("worker {worker_id} handshake timed out after {timeout:?}")]
    WorkerHandshakeTimeout { worker_id: WorkerId, timeout: Duration },

    #[error("worker {worker_id} unresponsive after {missed} missed pings")]
    WorkerUnresponsive { worker_id: WorkerId, missed: u32 },

    #[error("worker {worker_id}: {source}")]
    Worker {
        worker_id: WorkerId,
        source: WorkerError,
    },

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("no owner for {0}")]
    NoOwner(String),

    #[error("worker pool is at its limit of {max} workers")]
    PoolFull { max: usize },

    #[error("worker pool already initialized")]
    AlreadyInitialized,

    #[error("worker pool not initialized")]
    NotInitialized,

    #[error(transparent)]
    Lock(#[from] LockError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Receives unrecoverable worker failures with a label naming the source.
/// What happens next belongs to the surrounding server.
pub type FatalSink = Arc<dyn Fn(SchedulerError, &str) + Send + Sync>;

/// A sink that only logs.
pub fn log_fatal_sink() -> FatalSink {
    Arc::new(|err: SchedulerError, source: &str| {
        error!(%source, error = %err, "fatal worker error");
    })
}
