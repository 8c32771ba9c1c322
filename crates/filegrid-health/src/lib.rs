//! filegrid-health: heartbeat monitoring for dedicated workers.
//!
//! Each watched worker gets a background task that pings it on an interval
//! and measures how long the answer takes. A ping that errors or exceeds
//! the latency threshold counts as a miss; a single answered ping resets
//! the count.
//!
//! # Architecture
//!
//! ```text
//! WorkerWatchdog
//!   ├── Per-worker background task
//!   │   ├── HealthTracker (consecutive misses, threshold)
//!   │   └── ping() → PingResult
//!   └── UnresponsiveCallback → fatal error sink
//! ```
//!
//! Escalation is final: once a worker crosses the threshold its loop stops
//! and the callback decides what happens to it.

pub mod checker;
pub mod watchdog;

pub use checker::{HealthTracker, PingResult, WorkerHealth, ping};
pub use watchdog::{UnresponsiveCallback, WorkerWatchdog};
