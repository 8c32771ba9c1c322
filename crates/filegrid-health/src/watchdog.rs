//! Worker watchdog: background heartbeat loops for dedicated workers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use filegrid_core::{HealthSettings, WorkerId};
use filegrid_worker::{WorkerError, WorkerHandle};

use crate::checker::{HealthTracker, PingResult, ping};

/// Invoked once when a worker crosses the unresponsive threshold.
pub type UnresponsiveCallback = Arc<dyn Fn(WorkerId, WorkerError) + Send + Sync>;

/// Per-worker loop state.
struct WatchSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Runs one heartbeat loop per watched worker.
pub struct WorkerWatchdog {
    settings: HealthSettings,
    /// Active loops: worker id → slot.
    watches: Arc<RwLock<HashMap<WorkerId, WatchSlot>>>,
    on_unresponsive: Option<UnresponsiveCallback>,
}

impl WorkerWatchdog {
    /// A watchdog with no watches and a logging-only callback.
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            settings,
            watches: Arc::new(RwLock::new(HashMap::new())),
            on_unresponsive: None,
        }
    }

    /// Call `callback` when a watched worker is declared unresponsive.
    pub fn with_callback(mut self, callback: UnresponsiveCallback) -> Self {
        self.on_unresponsive = Some(callback);
        self
    }

    /// Ping interval, timeout and miss threshold.
    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Start watching `worker` under `id`, replacing any loop already
    /// watching that id.
    pub async fn watch(&self, id: WorkerId, worker: Arc<dyn WorkerHandle>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = self.settings.clone();
        let callback = self.on_unresponsive.clone();

        let handle = tokio::spawn(async move {
            run_watch_loop(id, worker, settings, callback, shutdown_rx).await;
        });

        let mut watches = self.watches.write().await;
        if let Some(old) = watches.insert(id, WatchSlot { handle, shutdown_tx }) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(worker_id = id, interval = ?self.settings.interval, "worker watchdog started");
    }

    /// Stop watching a worker.
    pub async fn unwatch(&self, id: WorkerId) {
        let mut watches = self.watches.write().await;
        if let Some(slot) = watches.remove(&id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(worker_id = id, "worker watchdog stopped");
        }
    }

    /// Stop all loops (for shutdown).
    pub async fn stop_all(&self) {
        let mut watches = self.watches.write().await;
        for (id, slot) in watches.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(worker_id = id, "worker watchdog stopped");
        }
    }

    /// Ids whose loop is still running.
    pub async fn active_watches(&self) -> Vec<WorkerId> {
        let watches = self.watches.read().await;
        let mut ids: Vec<WorkerId> = watches
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Whether worker `id` has a live watch loop.
    pub async fn is_watching(&self, id: WorkerId) -> bool {
        let watches = self.watches.read().await;
        watches.get(&id).is_some_and(|slot| !slot.handle.is_finished())
    }
}

async fn run_watch_loop(
    id: WorkerId,
    worker: Arc<dyn WorkerHandle>,
    settings: HealthSettings,
    callback: Option<UnresponsiveCallback>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = HealthTracker::new(settings.unresponsive_threshold);
    debug!(worker_id = id, "watchdog loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(settings.interval) => {
                let result = ping(worker.as_ref(), settings.timeout).await;
                if let PingResult::Answered(latency) = result {
                    debug!(worker_id = id, ?latency, "heartbeat");
                }
                tracker.record(result);

                if tracker.is_unresponsive() {
                    let missed = tracker.consecutive_misses();
                    error!(worker_id = id, missed, "worker unresponsive, escalating");
                    if let Some(ref cb) = callback {
                        cb(id, WorkerError::Unresponsive { missed });
                    }
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!(worker_id = id, "watchdog loop shutting down");
                break;
            }
        }
    }
}
