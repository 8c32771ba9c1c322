//! Heartbeat ping logic.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use filegrid_worker::WorkerHandle;
use filegrid_worker::protocol::method;

/// Result of a single heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// The worker answered within the latency threshold.
    Answered(Duration),
    /// No answer within the latency threshold.
    TimedOut,
    /// The call failed outright (closed channel, worker error).
    Failed,
}

/// Health of a worker as seen by its watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Unknown,
    Healthy,
    /// Missed at least one ping but still under the threshold.
    Degraded,
    Unresponsive,
}

/// Tracks consecutive missed pings for one worker.
#[derive(Debug)]
pub struct HealthTracker {
    status: WorkerHealth,
    consecutive_misses: u32,
    /// Misses before the worker is declared unresponsive.
    threshold: u32,
}

impl HealthTracker {
    /// Escalate after `threshold` consecutive misses, at least one.
    pub fn new(threshold: u32) -> Self {
        Self {
            status: WorkerHealth::Unknown,
            consecutive_misses: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record a ping result and return the new health.
    pub fn record(&mut self, result: PingResult) -> WorkerHealth {
        match result {
            PingResult::Answered(_) => {
                if self.consecutive_misses > 0 {
                    debug!(misses = self.consecutive_misses, "worker answered again");
                }
                self.consecutive_misses = 0;
                self.status = WorkerHealth::Healthy;
            }
            PingResult::TimedOut | PingResult::Failed => {
                self.consecutive_misses += 1;
                if self.consecutive_misses >= self.threshold {
                    if self.status != WorkerHealth::Unresponsive {
                        warn!(
                            misses = self.consecutive_misses,
                            threshold = self.threshold,
                            "worker marked unresponsive"
                        );
                    }
                    self.status = WorkerHealth::Unresponsive;
                } else {
                    self.status = WorkerHealth::Degraded;
                }
            }
        }
        self.status
    }

    /// Health derived from the recent ping history.
    pub fn status(&self) -> WorkerHealth {
        self.status
    }

    /// Misses since the last answered ping.
    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    /// Whether the miss count has reached the threshold.
    pub fn is_unresponsive(&self) -> bool {
        self.status == WorkerHealth::Unresponsive
    }
}

/// Ping `worker`, giving up after `timeout`.
pub async fn ping(worker: &dyn WorkerHandle, timeout: Duration) -> PingResult {
    let started = Instant::now();
    match tokio::time::timeout(timeout, worker.call(method::PING, json!({}))).await {
        Ok(Ok(_)) => PingResult::Answered(started.elapsed()),
        Ok(Err(_)) => PingResult::Failed,
        Err(_) => PingResult::TimedOut,
    }
}
