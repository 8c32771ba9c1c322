//! Scripted workers for scheduler integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use filegrid_core::{
    FileStats, MemoryFileStats, SchedulerSettings, StaticProjectConfig, WorkerId,
};
use filegrid_scheduler::{FatalSink, FileAllocator, SchedulerError, WorkerManager};
use filegrid_worker::protocol::{Buffer, method};
use filegrid_worker::{
    EventHandler, WorkerError, WorkerHandle, WorkerKind, WorkerResult, WorkerSpawner,
};

/// One recorded call: the spawn id of the mock and the method invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub worker: WorkerId,
    pub method: String,
}

pub struct MockWorker {
    pub spawn_id: WorkerId,
    kind: WorkerKind,
    hang_handshake: bool,
    calls: Arc<Mutex<Vec<Call>>>,
    buffers: Mutex<Vec<Buffer>>,
    ended: AtomicBool,
}

impl MockWorker {
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn buffers(&self) -> Vec<Buffer> {
        self.buffers.lock().clone()
    }
}

#[async_trait]
impl WorkerHandle for MockWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    async fn call(&self, method: &str, payload: Value) -> WorkerResult<Value> {
        if self.is_ended() {
            return Err(WorkerError::Closed);
        }
        self.calls.lock().push(Call {
            worker: self.spawn_id,
            method: method.to_string(),
        });
        match method {
            method::HANDSHAKE if self.hang_handshake => std::future::pending().await,
            method::GET_BUFFERS => Ok(serde_json::to_value(self.buffers())?),
            method::UPDATE_BUFFER => {
                self.buffers.lock().push(serde_json::from_value(payload)?);
                Ok(Value::Null)
            }
            method::EVICT => Ok(json!({ "evicted": true })),
            _ => Ok(Value::Null),
        }
    }

    fn subscribe(&self, _event: &str, _handler: EventHandler) {}

    async fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

/// Records every spawn and call. Dedicated spawns can be held at a gate,
/// failed, or made to hang in the handshake.
#[derive(Default)]
pub struct MockSpawner {
    calls: Arc<Mutex<Vec<Call>>>,
    spawned: Mutex<Vec<Arc<MockWorker>>>,
    dedicated_requests: Mutex<Vec<WorkerId>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub fail_dedicated: AtomicBool,
    pub hang_handshake: AtomicBool,
}

impl MockSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold every dedicated spawn until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    pub fn dedicated_requests(&self) -> Vec<WorkerId> {
        self.dedicated_requests.lock().clone()
    }

    pub fn spawned(&self) -> Vec<Arc<MockWorker>> {
        self.spawned.lock().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.method == method).count()
    }

    fn make(&self, id: WorkerId, kind: WorkerKind) -> Arc<MockWorker> {
        let worker = Arc::new(MockWorker {
            spawn_id: id,
            kind,
            hang_handshake: self.hang_handshake.load(Ordering::SeqCst),
            calls: self.calls.clone(),
            buffers: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        });
        self.spawned.lock().push(worker.clone());
        worker
    }
}

#[async_trait]
impl WorkerSpawner for MockSpawner {
    async fn spawn_in_process(&self, id: WorkerId) -> WorkerResult<Arc<dyn WorkerHandle>> {
        Ok(self.make(id, WorkerKind::InProcess))
    }

    async fn spawn_dedicated(&self, id: WorkerId) -> WorkerResult<Arc<dyn WorkerHandle>> {
        self.dedicated_requests.lock().push(id);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| WorkerError::Spawn(e.to_string()))?;
        }
        if self.fail_dedicated.load(Ordering::SeqCst) {
            return Err(WorkerError::Spawn("scripted failure".to_string()));
        }
        Ok(self.make(id, WorkerKind::Dedicated))
    }
}

/// Fatal errors captured as `(label, error)`.
#[derive(Clone, Default)]
pub struct FatalLog(Arc<Mutex<Vec<(String, SchedulerError)>>>);

impl FatalLog {
    pub fn sink(&self) -> FatalSink {
        let log = self.0.clone();
        Arc::new(move |err: SchedulerError, source: &str| log.lock().push((source.to_string(), err)))
    }

    pub fn entries(&self) -> Vec<(String, SchedulerError)> {
        self.0.lock().clone()
    }
}

pub fn settings() -> SchedulerSettings {
    SchedulerSettings {
        max_worker_count: 4,
        inband_only: false,
        move_out_of_process_bytes: u64::MAX,
        spawn_worker_bytes: u64::MAX,
        handshake_timeout: Duration::from_secs(5),
    }
}

pub const MAX_FILE_SIZE: u64 = 1000;

pub struct Harness {
    pub stats: Arc<MemoryFileStats>,
    pub spawner: Arc<MockSpawner>,
    pub fatal: FatalLog,
    pub allocator: Arc<FileAllocator>,
}

impl Harness {
    pub async fn start(settings: SchedulerSettings) -> Self {
        Self::start_with(settings, MockSpawner::new()).await
    }

    pub async fn start_with(settings: SchedulerSettings, spawner: Arc<MockSpawner>) -> Self {
        let stats = Arc::new(MemoryFileStats::new());
        let fatal = FatalLog::default();
        let manager = WorkerManager::new(
            settings,
            stats.clone(),
            Arc::new(StaticProjectConfig::new(MAX_FILE_SIZE)),
            spawner.clone(),
        )
        .with_fatal_sink(fatal.sink());
        manager.init().await.expect("init");
        Self {
            stats,
            spawner,
            fatal,
            allocator: Arc::new(FileAllocator::new(Arc::new(manager))),
        }
    }

    pub fn manager(&self) -> &WorkerManager {
        self.allocator.manager()
    }

    pub fn file(&self, path: &str, size: u64) {
        self.stats.insert(Path::new(path), FileStats::with_size(size));
    }

    /// Bytes and files across every non-ghost worker.
    pub fn totals(&self) -> (u64, u64) {
        self.manager()
            .workers()
            .iter()
            .filter(|w| !w.is_ghost())
            .fold((0, 0), |(bytes, files), w| {
                (bytes + w.byte_count, files + w.file_count)
            })
    }
}
