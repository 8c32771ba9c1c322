//! The worker execution handle.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkerResult;

/// Where a worker executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Shares the scheduler's runtime.
    InProcess,
    /// Runs on its own execution context.
    Dedicated,
}

/// Callback for events a worker publishes.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// An opaque reference to a worker. The scheduler never looks inside
/// payloads beyond what it needs for bookkeeping.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn kind(&self) -> WorkerKind;

    /// Invoke `method` on the worker and await its response.
    async fn call(&self, method: &str, payload: Value) -> WorkerResult<Value>;

    /// Register `handler` for every `event` the worker publishes.
    fn subscribe(&self, event: &str, handler: EventHandler);

    /// Stop the worker, letting queued calls drain first. Calls issued
    /// afterwards fail with `Closed`.
    async fn end(&self);

    /// Stop the worker without waiting for calls in flight; they fail with
    /// `Closed`. Used on workers already considered unresponsive.
    async fn terminate(&self) {
        self.end().await;
    }
}
