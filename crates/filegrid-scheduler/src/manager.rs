//! Worker pool manager.
//!
//! Owns the worker table and makes the scheduling decision for every new
//! file: least-loaded non-ghost worker, growing the pool when that worker
//! is over the spawn threshold, and moving worker 0 out of process once it
//! owns too many bytes.
//!
//! Every spawn and the worker-0 swap hold the id lock for the worker being
//! changed. Anyone about to hand out a worker waits on that id first, so a
//! half-initialized or half-swapped worker is never observed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use filegrid_core::{
    FileStats, FileStatsProvider, HealthSettings, OWN_WORKER_ID, ProjectConfigProvider,
    SchedulerSettings, WorkerId,
};
use filegrid_health::{UnresponsiveCallback, WorkerWatchdog};
use filegrid_lock::{Lock, Locker};
use filegrid_worker::protocol::{Buffer, LogEvent, event, method};
use filegrid_worker::{WorkerError, WorkerHandle, WorkerKind, WorkerSpawner};

use crate::container::{WorkerContainer, WorkerState, WorkerSummary};
use crate::error::{FatalSink, SchedulerError, SchedulerResult, log_fatal_sink};

/// Locker keyed by worker id.
pub type WorkerLocker = Locker<WorkerId, WorkerId>;

pub struct WorkerManager {
    settings: SchedulerSettings,
    stats: Arc<dyn FileStatsProvider>,
    projects: Arc<dyn ProjectConfigProvider>,
    spawner: Arc<dyn WorkerSpawner>,
    fatal: FatalSink,
    watchdog: WorkerWatchdog,
    locker: WorkerLocker,
    workers: RwLock<BTreeMap<WorkerId, WorkerContainer>>,
    next_id: AtomicU32,
    /// Set once moving worker 0 out of process has failed; it stays put.
    own_worker_pinned: AtomicBool,
}

impl WorkerManager {
    /// Create an empty pool. Call [`init`](Self::init) before assigning files.
    pub fn new(
        settings: SchedulerSettings,
        stats: Arc<dyn FileStatsProvider>,
        projects: Arc<dyn ProjectConfigProvider>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        let fatal = log_fatal_sink();
        Self {
            settings,
            stats,
            projects,
            spawner,
            watchdog: build_watchdog(HealthSettings::default(), &fatal),
            fatal,
            locker: Locker::identity(),
            workers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(OWN_WORKER_ID + 1),
            own_worker_pinned: AtomicBool::new(false),
        }
    }

    /// Use `health` for the dedicated-worker watchdog.
    pub fn with_health(mut self, health: HealthSettings) -> Self {
        self.watchdog = build_watchdog(health, &self.fatal);
        self
    }

    /// Send unrecoverable worker failures to `sink` instead of only logging them.
    pub fn with_fatal_sink(mut self, sink: FatalSink) -> Self {
        let health = self.watchdog.settings().clone();
        self.fatal = sink;
        self.watchdog = build_watchdog(health, &self.fatal);
        self
    }

    /// Resolved scheduler settings.
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Per-worker-id lock domain for spawns and the worker-0 swap.
    pub fn locker(&self) -> &WorkerLocker {
        &self.locker
    }

    /// Watchdog pinging the dedicated workers.
    pub fn watchdog(&self) -> &WorkerWatchdog {
        &self.watchdog
    }

    /// Snapshot of worker `id`.
    pub fn get_worker(&self, id: WorkerId) -> Option<WorkerContainer> {
        self.workers.read().get(&id).cloned()
    }

    /// Snapshot of every worker, ghosts included, ordered by id.
    pub fn workers(&self) -> Vec<WorkerContainer> {
        self.workers.read().values().cloned().collect()
    }

    /// Workers that can take new files.
    pub fn worker_count(&self) -> usize {
        self.workers
            .read()
            .values()
            .filter(|w| w.is_assignable())
            .count()
    }

    /// Serializable load of every worker, ordered by id.
    pub fn summary(&self) -> Vec<WorkerSummary> {
        self.workers.read().values().map(WorkerContainer::summary).collect()
    }

    /// Whether worker 0 still runs in-process.
    pub fn is_own_worker_in_process(&self) -> bool {
        self.workers
            .read()
            .get(&OWN_WORKER_ID)
            .is_some_and(|w| w.kind() == Some(WorkerKind::InProcess))
    }

    /// Start worker 0 in-process.
    pub async fn init(&self) -> SchedulerResult<()> {
        let lock = {
            let mut workers = self.workers.write();
            if workers.contains_key(&OWN_WORKER_ID) {
                return Err(SchedulerError::AlreadyInitialized);
            }
            let lock = self.locker.get_new_lock(&OWN_WORKER_ID)?;
            workers.insert(OWN_WORKER_ID, WorkerContainer::spawning(OWN_WORKER_ID));
            lock
        };
        self.start_worker(OWN_WORKER_ID, WorkerKind::InProcess, lock)
            .await
            .map(|_| ())
    }

    /// Add a dedicated worker to the pool, up to the configured maximum.
    pub async fn spawn_worker(&self) -> SchedulerResult<WorkerContainer> {
        let (id, lock) = self.reserve_worker()?.ok_or(SchedulerError::PoolFull {
            max: self.settings.max_worker_count,
        })?;
        self.start_worker(id, WorkerKind::Dedicated, lock).await
    }

    /// Pick the worker that should own `path`, accounting its size there.
    pub async fn get_next_worker(&self, path: &Path) -> SchedulerResult<WorkerContainer> {
        self.assign(path).await.map(|(worker, _)| worker)
    }

    /// [`get_next_worker`](Self::get_next_worker), also returning the stats
    /// the assignment was accounted with.
    pub(crate) async fn assign(&self, path: &Path) -> SchedulerResult<(WorkerContainer, FileStats)> {
        let stats = self.resolve_stats(path).await?;
        self.verify_size(path, &stats)?;
        if self.workers.read().is_empty() {
            return Err(SchedulerError::NotInitialized);
        }

        // Never hand out worker 0 while it is being swapped.
        self.locker.wait_lock(&OWN_WORKER_ID).await;

        if self.settings.inband_only {
            self.own(OWN_WORKER_ID, &stats)?;
            return self.settle(OWN_WORKER_ID, stats).await;
        }

        self.maybe_replace_own_worker().await?;

        let (least, grow) = {
            let workers = self.workers.read();
            let Some(least) = workers
                .values()
                .filter(|w| w.is_assignable())
                .min_by_key(|w| w.byte_count)
            else {
                return Err(SchedulerError::NotInitialized);
            };
            let live = workers.values().filter(|w| w.is_assignable()).count();
            let grow = least.byte_count > self.settings.spawn_worker_bytes
                && live < self.settings.max_worker_count;
            (least.id, grow)
        };

        // The new worker takes the file, not the one that tripped the
        // threshold.
        let reserved = if grow { self.reserve_worker()? } else { None };
        let id = match reserved {
            Some((id, lock)) => self.start_worker(id, WorkerKind::Dedicated, lock).await?.id,
            None => least,
        };

        self.own(id, &stats)?;
        self.settle(id, stats).await
    }

    /// Move worker 0 to a dedicated worker, keeping its id and totals.
    /// Fails if worker 0 is locked, which means a swap is already running.
    pub async fn replace_own_worker(&self) -> SchedulerResult<()> {
        let lock = self.locker.get_new_lock(&OWN_WORKER_ID)?;
        self.swap_own_worker(lock).await
    }

    /// Count a file of `stats.size` bytes against worker `id`.
    pub fn own(&self, id: WorkerId, stats: &FileStats) -> SchedulerResult<()> {
        let mut workers = self.workers.write();
        let worker = workers.get_mut(&id).ok_or(SchedulerError::UnknownWorker(id))?;
        worker.own(stats);
        debug!(worker_id = id, bytes = stats.size, total = worker.byte_count, "owned");
        Ok(())
    }

    /// Undo one [`own`](Self::own).
    pub fn disown(&self, id: WorkerId, stats: &FileStats) -> SchedulerResult<()> {
        let mut workers = self.workers.write();
        let worker = workers.get_mut(&id).ok_or(SchedulerError::UnknownWorker(id))?;
        worker.disown(stats);
        debug!(worker_id = id, bytes = stats.size, total = worker.byte_count, "disowned");
        Ok(())
    }

    /// Fail if `stats` is over the size limit of the project `path` is in.
    pub fn verify_size(&self, path: &Path, stats: &FileStats) -> SchedulerResult<()> {
        let max = self.projects.max_file_size(path);
        if stats.size > max {
            warn!(path = %path.display(), size = stats.size, max, "file over project size limit");
            return Err(SchedulerError::SizeLimitExceeded {
                path: path.display().to_string(),
                size: stats.size,
                max,
            });
        }
        Ok(())
    }

    /// End every worker and stop their watchdogs.
    pub async fn end(&self) {
        self.watchdog.stop_all().await;
        let handles: Vec<Arc<dyn WorkerHandle>> = {
            let mut workers = self.workers.write();
            workers
                .values_mut()
                .filter_map(|worker| {
                    let handle = worker.handle().cloned();
                    if handle.is_some() {
                        worker.state = WorkerState::Ended;
                    }
                    handle
                })
                .collect()
        };
        for handle in handles {
            handle.end().await;
        }
        info!("worker pool ended");
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn resolve_stats(&self, path: &Path) -> SchedulerResult<FileStats> {
        self.stats.wait_if_initializing_watch(path).await;
        self.stats
            .get_file_stats(path)
            .ok_or_else(|| SchedulerError::StatsUnavailable {
                path: path.display().to_string(),
            })
    }

    /// Wait out any spawn of `id`, then return it. Undoes the `own` if the
    /// worker did not come up.
    async fn settle(&self, id: WorkerId, stats: FileStats) -> SchedulerResult<(WorkerContainer, FileStats)> {
        self.locker.wait_lock(&id).await;
        match self.get_worker(id) {
            Some(worker) if worker.is_ready() => Ok((worker, stats)),
            Some(_) => {
                let _ = self.disown(id, &stats);
                Err(SchedulerError::UnknownWorker(id))
            }
            None => Err(SchedulerError::UnknownWorker(id)),
        }
    }

    /// Reserve a table slot and its id lock for a new worker, unless the
    /// pool is full.
    fn reserve_worker(&self) -> SchedulerResult<Option<(WorkerId, Lock<WorkerId>)>> {
        let mut workers = self.workers.write();
        let live = workers.values().filter(|w| w.is_assignable()).count();
        if live >= self.settings.max_worker_count {
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let lock = self.locker.get_new_lock(&id)?;
        workers.insert(id, WorkerContainer::spawning(id));
        debug!(worker_id = id, live, "worker slot reserved");
        Ok(Some((id, lock)))
    }

    /// Spawn and handshake the worker reserved under `id`. The id lock is
    /// released once it is ready or removed.
    async fn start_worker(
        &self,
        id: WorkerId,
        kind: WorkerKind,
        _lock: Lock<WorkerId>,
    ) -> SchedulerResult<WorkerContainer> {
        info!(worker_id = id, ?kind, "spawning worker");
        let spawned = match kind {
            WorkerKind::InProcess => self.spawner.spawn_in_process(id).await,
            WorkerKind::Dedicated => self.spawner.spawn_dedicated(id).await,
        };
        let result = match spawned {
            Ok(handle) => {
                self.subscribe_logs(id, &handle);
                self.handshake(id, handle).await
            }
            Err(source) => Err(SchedulerError::WorkerSpawnFailure { worker_id: id, source }),
        };

        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                self.workers.write().remove(&id);
                self.report_fatal(id, &err);
                return Err(err);
            }
        };

        let container = {
            let mut workers = self.workers.write();
            let worker = workers.get_mut(&id).ok_or(SchedulerError::UnknownWorker(id))?;
            worker.state = WorkerState::Ready(handle.clone());
            worker.clone()
        };
        if kind == WorkerKind::Dedicated {
            self.watchdog.watch(id, handle).await;
        }
        info!(worker_id = id, ?kind, "worker ready");
        Ok(container)
    }

    async fn handshake(
        &self,
        id: WorkerId,
        handle: Arc<dyn WorkerHandle>,
    ) -> SchedulerResult<Arc<dyn WorkerHandle>> {
        let timeout = self.settings.handshake_timeout;
        let call = handle.call(method::HANDSHAKE, json!({ "worker_id": id }));
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(_)) => Ok(handle),
            Ok(Err(source)) => {
                handle.terminate().await;
                Err(SchedulerError::WorkerSpawnFailure { worker_id: id, source })
            }
            Err(_) => {
                handle.terminate().await;
                Err(SchedulerError::WorkerHandshakeTimeout { worker_id: id, timeout })
            }
        }
    }

    fn own_worker_needs_replacing(&self) -> bool {
        if self.own_worker_pinned.load(Ordering::SeqCst) {
            return false;
        }
        self.workers.read().get(&OWN_WORKER_ID).is_some_and(|w| {
            w.kind() == Some(WorkerKind::InProcess)
                && w.byte_count > self.settings.move_out_of_process_bytes
        })
    }

    async fn maybe_replace_own_worker(&self) -> SchedulerResult<()> {
        while self.own_worker_needs_replacing() {
            match self.locker.get_new_lock(&OWN_WORKER_ID) {
                // Re-check: a swap may have finished between the check and the lock.
                Ok(lock) if self.own_worker_needs_replacing() => {
                    // Already reported and pinned; worker 0 keeps serving in-process.
                    if let Err(err) = self.swap_own_worker(lock).await {
                        warn!(error = %err, "worker 0 stays in-process");
                    }
                    return Ok(());
                }
                Ok(_) => return Ok(()),
                Err(_) => self.locker.wait_lock_drained(&OWN_WORKER_ID).await,
            }
        }
        Ok(())
    }

    async fn swap_own_worker(&self, lock: Lock<WorkerId>) -> SchedulerResult<()> {
        let result = self.try_swap_own_worker().await;
        if let Err(err) = &result {
            self.own_worker_pinned.store(true, Ordering::SeqCst);
            self.report_fatal(OWN_WORKER_ID, err);
        }
        lock.release();
        result
    }

    async fn try_swap_own_worker(&self) -> SchedulerResult<()> {
        let (old_handle, bytes) = match self.get_worker(OWN_WORKER_ID) {
            Some(WorkerContainer {
                state: WorkerState::Ready(handle),
                byte_count,
                ..
            }) => (handle, byte_count),
            Some(_) => return Err(SchedulerError::UnknownWorker(OWN_WORKER_ID)),
            None => return Err(SchedulerError::NotInitialized),
        };
        if old_handle.kind() == WorkerKind::Dedicated {
            return Ok(());
        }

        let ghost_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(ghost_id, bytes, "moving worker 0 out of process");

        let new_handle = self
            .spawner
            .spawn_dedicated(ghost_id)
            .await
            .map_err(|source| SchedulerError::WorkerSpawnFailure {
                worker_id: OWN_WORKER_ID,
                source,
            })?;
        self.subscribe_logs(OWN_WORKER_ID, &new_handle);
        let new_handle = self.handshake(OWN_WORKER_ID, new_handle).await?;
        self.workers.write().insert(
            ghost_id,
            WorkerContainer {
                id: ghost_id,
                file_count: 0,
                byte_count: 0,
                state: WorkerState::Ghost(new_handle.clone()),
            },
        );

        // Bounded like the handshake: a stuck worker must not hold id 0.
        let timeout = self.settings.handshake_timeout;
        let transfer = tokio::time::timeout(
            timeout,
            transfer_buffers(old_handle.as_ref(), new_handle.as_ref()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(WorkerError::Call {
                method: method::GET_BUFFERS.to_string(),
                message: format!("buffer transfer timed out after {timeout:?}"),
            })
        });
        let transferred = match transfer {
            Ok(count) => count,
            Err(source) => {
                self.workers.write().remove(&ghost_id);
                new_handle.terminate().await;
                return Err(SchedulerError::Worker {
                    worker_id: OWN_WORKER_ID,
                    source,
                });
            }
        };
        old_handle.end().await;

        {
            let mut workers = self.workers.write();
            workers.remove(&ghost_id);
            if let Some(own) = workers.get_mut(&OWN_WORKER_ID) {
                own.state = WorkerState::Ready(new_handle.clone());
            }
        }
        self.watchdog.watch(OWN_WORKER_ID, new_handle).await;

        info!(transferred, bytes, "worker 0 moved out of process");
        Ok(())
    }

    fn subscribe_logs(&self, id: WorkerId, handle: &Arc<dyn WorkerHandle>) {
        handle.subscribe(
            event::LOG,
            Arc::new(move |payload: Value| {
                if let Ok(entry) = serde_json::from_value::<LogEvent>(payload) {
                    debug!(worker_id = id, message = %entry.message, "worker log");
                }
            }),
        );
    }

    fn report_fatal(&self, id: WorkerId, err: &SchedulerError) {
        (self.fatal)(err.clone(), &format!("worker {id}"));
    }
}

/// Copy every in-editor buffer from one worker to another.
async fn transfer_buffers(from: &dyn WorkerHandle, to: &dyn WorkerHandle) -> Result<usize, WorkerError> {
    let buffers: Vec<Buffer> = serde_json::from_value(from.call(method::GET_BUFFERS, Value::Null).await?)?;
    for buffer in &buffers {
        to.call(method::UPDATE_BUFFER, serde_json::to_value(buffer)?)
            .await?;
    }
    Ok(buffers.len())
}

fn build_watchdog(settings: HealthSettings, fatal: &FatalSink) -> WorkerWatchdog {
    let fatal = fatal.clone();
    let callback: UnresponsiveCallback = Arc::new(move |worker_id: WorkerId, err: WorkerError| {
        let err = match err {
            WorkerError::Unresponsive { missed } => {
                SchedulerError::WorkerUnresponsive { worker_id, missed }
            }
            source => SchedulerError::Worker { worker_id, source },
        };
        fatal(err, &format!("worker {worker_id}"));
    });
    WorkerWatchdog::new(settings).with_callback(callback)
}
