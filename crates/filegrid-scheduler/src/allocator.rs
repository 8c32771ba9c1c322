//! Path-to-worker ownership.
//!
//! A path is assigned to a worker the first time it is requested and stays
//! there until it is deleted. Edits keep the owner and only move bytes in
//! the owner's totals.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use filegrid_core::{FileStats, WorkerId, normalize_path};
use filegrid_lock::{GlobalLock, Locker};
use filegrid_worker::protocol::{Analysis, Buffer, EvictRequest, EvictResponse, PathRequest, method};
use filegrid_worker::WorkerError;

use crate::container::WorkerContainer;
use crate::error::{SchedulerError, SchedulerResult};
use crate::manager::WorkerManager;

/// Locker keyed by normalized path.
pub type FilePathLocker = Locker<Path, String>;

/// The worker a path belongs to and the size it was last accounted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ownership {
    pub worker_id: WorkerId,
    pub size: u64,
}

impl Ownership {
    fn stats(&self) -> FileStats {
        FileStats::with_size(self.size)
    }
}

pub struct FileAllocator {
    manager: Arc<WorkerManager>,
    locker: FilePathLocker,
    owners: RwLock<HashMap<String, Ownership>>,
    changed: GlobalLock,
    deleted: GlobalLock,
    settled: GlobalLock,
}

impl FileAllocator {
    /// Create an allocator over `manager` with an empty ownership map.
    pub fn new(manager: Arc<WorkerManager>) -> Self {
        let changed = GlobalLock::new();
        let deleted = GlobalLock::new();
        let settled = GlobalLock::new();
        settled.attach_lock(&changed);
        settled.attach_lock(&deleted);
        Self {
            manager,
            locker: Locker::new(|path: &Path| normalize_path(path)),
            owners: RwLock::new(HashMap::new()),
            changed,
            deleted,
            settled,
        }
    }

    /// The pool this allocator assigns into.
    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    /// Per-path lock domain for first assignment, deletes and changes.
    pub fn locker(&self) -> &FilePathLocker {
        &self.locker
    }

    /// Pending change notifications.
    pub fn changed(&self) -> &GlobalLock {
        &self.changed
    }

    /// Pending delete notifications.
    pub fn deleted(&self) -> &GlobalLock {
        &self.deleted
    }

    /// Every change and delete notification still in flight.
    pub fn settled(&self) -> &GlobalLock {
        &self.settled
    }

    /// Resolve once no change or delete notification is in flight.
    pub async fn wait_settled(&self) {
        self.settled.wait().await;
    }

    /// Owner and accounted size of `path`, if assigned.
    pub fn get_ownership(&self, path: &Path) -> Option<Ownership> {
        self.owners.read().get(&normalize_path(path)).copied()
    }

    /// Owning worker id of `path`, if assigned.
    pub fn get_owner_id(&self, path: &Path) -> Option<WorkerId> {
        self.get_ownership(path).map(|o| o.worker_id)
    }

    /// Whether `path` has been assigned.
    pub fn has_owner(&self, path: &Path) -> bool {
        self.get_ownership(path).is_some()
    }

    /// Owning worker id of `path`, failing with `NoOwner` when unassigned.
    pub fn get_owner_assert(&self, path: &Path) -> SchedulerResult<WorkerId> {
        self.get_owner_id(path)
            .ok_or_else(|| SchedulerError::NoOwner(normalize_path(path)))
    }

    /// Owned paths in sorted order.
    pub fn owned_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.owners.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Group `paths` by owning worker, assigning any that are unowned.
    pub async fn group_paths_by_worker(
        &self,
        paths: &[PathBuf],
    ) -> SchedulerResult<BTreeMap<WorkerId, Vec<PathBuf>>> {
        let mut groups: BTreeMap<WorkerId, Vec<PathBuf>> = BTreeMap::new();
        for path in paths {
            let worker = self.get_or_assign_owner(path).await?;
            groups.entry(worker.id).or_default().push(path.clone());
        }
        Ok(groups)
    }

    /// The worker that owns `path`, assigning one on first request.
    pub async fn get_or_assign_owner(&self, path: &Path) -> SchedulerResult<WorkerContainer> {
        if let Some(worker) = self.owning_worker(path).await? {
            return Ok(worker);
        }

        let _lock = self.locker.get_lock(path).await;
        if let Some(worker) = self.owning_worker(path).await? {
            return Ok(worker);
        }

        let (worker, stats) = self.manager.assign(path).await?;
        self.owners.write().insert(
            normalize_path(path),
            Ownership {
                worker_id: worker.id,
                size: stats.size,
            },
        );
        info!(path = %path.display(), worker_id = worker.id, bytes = stats.size, "file assigned");
        Ok(worker)
    }

    /// Ask the owner of `path` to drop cached results for it. Returns
    /// whether anything was cached; unowned paths return `false`.
    pub async fn evict(&self, path: &Path, reason: &str) -> SchedulerResult<bool> {
        let Some(worker) = self.owning_worker(path).await? else {
            return Ok(false);
        };
        let request = EvictRequest {
            path: normalize_path(path),
            reason: reason.to_string(),
        };
        let response: EvictResponse = call(&worker, method::EVICT, &request).await?;
        debug!(path = %path.display(), worker_id = worker.id, reason, evicted = response.evicted, "evict");
        Ok(response.evicted)
    }

    /// Check `stats` against the limit of the project containing `path`.
    pub fn verify_size(&self, path: &Path, stats: &FileStats) -> SchedulerResult<()> {
        self.manager.verify_size(path, stats)
    }

    /// Forward an in-editor buffer to the owner of `path`.
    pub async fn update_buffer(&self, path: &Path, content: &str) -> SchedulerResult<()> {
        let worker = self.get_or_assign_owner(path).await?;
        let buffer = Buffer {
            path: normalize_path(path),
            content: content.to_string(),
        };
        let _: Value = call(&worker, method::UPDATE_BUFFER, &buffer).await?;
        Ok(())
    }

    /// Byte and line counts of `path`, computed by its owner.
    pub async fn analyze(&self, path: &Path) -> SchedulerResult<Analysis> {
        let worker = self.get_or_assign_owner(path).await?;
        let request = PathRequest {
            path: normalize_path(path),
        };
        call(&worker, method::ANALYZE, &request).await
    }

    /// A path was deleted: evict it, drop its owner and give the bytes back.
    pub async fn handle_deleted(&self, path: &Path) -> SchedulerResult<()> {
        self.deleted
            .wrap(self.locker.wrap_lock(path, self.delete_locked(path)))
            .await
    }

    /// A path's content changed: evict it and move its accounted size to
    /// `stats`. Unowned paths are ignored; they are sized when assigned.
    pub async fn handle_change(&self, path: &Path, stats: FileStats) -> SchedulerResult<()> {
        self.changed
            .wrap(self.locker.wrap_lock(path, self.change_locked(path, stats)))
            .await
    }

    async fn delete_locked(&self, path: &Path) -> SchedulerResult<()> {
        let Some(ownership) = self.get_ownership(path) else {
            return Ok(());
        };
        if let Err(err) = self.evict(path, "deleted").await {
            warn!(path = %path.display(), error = %err, "evict on delete failed");
        }
        self.owners.write().remove(&normalize_path(path));
        self.manager.disown(ownership.worker_id, &ownership.stats())?;
        info!(path = %path.display(), worker_id = ownership.worker_id, bytes = ownership.size, "file released");
        Ok(())
    }

    async fn change_locked(&self, path: &Path, stats: FileStats) -> SchedulerResult<()> {
        let Some(ownership) = self.get_ownership(path) else {
            return Ok(());
        };
        if let Err(err) = self.evict(path, "changed").await {
            warn!(path = %path.display(), error = %err, "evict on change failed");
        }
        self.manager.verify_size(path, &stats)?;

        self.manager.disown(ownership.worker_id, &ownership.stats())?;
        self.manager.own(ownership.worker_id, &stats)?;
        self.owners.write().insert(
            normalize_path(path),
            Ownership {
                worker_id: ownership.worker_id,
                size: stats.size,
            },
        );
        debug!(
            path = %path.display(),
            worker_id = ownership.worker_id,
            old = ownership.size,
            new = stats.size,
            "file resized"
        );
        Ok(())
    }

    /// The current owner of `path`, once any spawn or swap of that worker
    /// has finished.
    async fn owning_worker(&self, path: &Path) -> SchedulerResult<Option<WorkerContainer>> {
        let Some(id) = self.get_owner_id(path) else {
            return Ok(None);
        };
        self.manager.locker().wait_lock(&id).await;
        self.manager
            .get_worker(id)
            .map(Some)
            .ok_or(SchedulerError::UnknownWorker(id))
    }
}

async fn call<Req, Resp>(worker: &WorkerContainer, method: &str, request: &Req) -> SchedulerResult<Resp>
where
    Req: Serialize,
    Resp: serde::de::DeserializeOwned,
{
    let tag = |source: WorkerError| SchedulerError::Worker {
        worker_id: worker.id,
        source,
    };
    let handle = worker.handle().ok_or(SchedulerError::UnknownWorker(worker.id))?;
    let payload = serde_json::to_value(request).map_err(|e| tag(e.into()))?;
    let response = handle.call(method, payload).await.map_err(tag)?;
    serde_json::from_value(response).map_err(|e| tag(e.into()))
}

#[cfg(test)]
mod tests {
    use filegrid_core::{MemoryFileStats, SchedulerSettings, StaticProjectConfig};
    use filegrid_worker::ThreadSpawner;

    use super::*;

    async fn allocator(files: &[(&str, u64)]) -> FileAllocator {
        let stats = MemoryFileStats::new();
        for (path, size) in files {
            stats.insert(Path::new(path), FileStats::with_size(*size));
        }
        let settings = SchedulerSettings {
            max_worker_count: 2,
            move_out_of_process_bytes: u64::MAX,
            spawn_worker_bytes: u64::MAX,
            ..SchedulerSettings::default()
        };
        let manager = WorkerManager::new(
            settings,
            Arc::new(stats),
            Arc::new(StaticProjectConfig::new(1000)),
            Arc::new(ThreadSpawner::default()),
        );
        manager.init().await.unwrap();
        FileAllocator::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn first_request_assigns_and_later_ones_reuse() {
        let allocator = allocator(&[("/p/a.js", 100)]).await;
        assert!(!allocator.has_owner(Path::new("/p/a.js")));

        let first = allocator.get_or_assign_owner(Path::new("/p/a.js")).await.unwrap();
        let again = allocator.get_or_assign_owner(Path::new("/p/./a.js")).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(
            allocator.get_ownership(Path::new("/p/a.js")),
            Some(Ownership { worker_id: 0, size: 100 })
        );
        assert_eq!(allocator.manager().get_worker(0).unwrap().file_count, 1);
        allocator.manager().end().await;
    }

    #[tokio::test]
    async fn owner_assert_fails_for_unknown_path() {
        let allocator = allocator(&[]).await;
        let err = allocator.get_owner_assert(Path::new("/p/none.js")).unwrap_err();
        assert!(matches!(err, SchedulerError::NoOwner(path) if path == "/p/none.js"));
        assert!(!allocator.evict(Path::new("/p/none.js"), "test").await.unwrap());
        allocator.manager().end().await;
    }

    #[tokio::test]
    async fn delete_releases_bytes() {
        let allocator = allocator(&[("/p/a.js", 100), ("/p/b.js", 50)]).await;
        allocator.get_or_assign_owner(Path::new("/p/a.js")).await.unwrap();
        allocator.get_or_assign_owner(Path::new("/p/b.js")).await.unwrap();

        allocator.handle_deleted(Path::new("/p/a.js")).await.unwrap();
        assert!(!allocator.has_owner(Path::new("/p/a.js")));
        assert_eq!(allocator.owned_paths(), vec!["/p/b.js".to_string()]);
        let own = allocator.manager().get_worker(0).unwrap();
        assert_eq!((own.file_count, own.byte_count), (1, 50));

        // Deleting twice is a no-op.
        allocator.handle_deleted(Path::new("/p/a.js")).await.unwrap();
        assert_eq!(allocator.manager().get_worker(0).unwrap().byte_count, 50);
        allocator.manager().end().await;
    }

    #[tokio::test]
    async fn change_moves_bytes_on_the_same_worker() {
        let allocator = allocator(&[("/p/a.js", 100)]).await;
        let owner = allocator.get_or_assign_owner(Path::new("/p/a.js")).await.unwrap();

        allocator
            .handle_change(Path::new("/p/a.js"), FileStats::with_size(300))
            .await
            .unwrap();
        assert_eq!(allocator.get_owner_id(Path::new("/p/a.js")), Some(owner.id));
        let worker = allocator.manager().get_worker(owner.id).unwrap();
        assert_eq!((worker.file_count, worker.byte_count), (1, 300));

        let err = allocator
            .handle_change(Path::new("/p/a.js"), FileStats::with_size(5000))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::SizeLimitExceeded { .. }));
        assert_eq!(allocator.manager().get_worker(owner.id).unwrap().byte_count, 300);
        assert!(!allocator.settled().is_locked());
        allocator.manager().end().await;
    }

    #[tokio::test]
    async fn change_to_unowned_path_is_ignored() {
        let allocator = allocator(&[]).await;
        allocator
            .handle_change(Path::new("/p/new.js"), FileStats::with_size(10))
            .await
            .unwrap();
        assert!(allocator.owned_paths().is_empty());
        allocator.manager().end().await;
    }

    #[tokio::test]
    async fn buffers_drive_analysis_and_edits_evict() {
        let allocator = allocator(&[("/p/a.js", 10)]).await;
        allocator
            .update_buffer(Path::new("/p/a.js"), "one\ntwo\nthree")
            .await
            .unwrap();

        let analysis = allocator.analyze(Path::new("/p/a.js")).await.unwrap();
        assert!(analysis.from_buffer);
        assert!(!analysis.cached);
        assert_eq!((analysis.bytes, analysis.lines), (13, 3));

        assert!(allocator.analyze(Path::new("/p/a.js")).await.unwrap().cached);
        assert!(allocator.evict(Path::new("/p/a.js"), "test").await.unwrap());
        assert!(!allocator.analyze(Path::new("/p/a.js")).await.unwrap().cached);
        allocator.manager().end().await;
    }

    #[tokio::test]
    async fn paths_group_by_owner() {
        let allocator = allocator(&[("/p/a.js", 10), ("/p/b.js", 10), ("/p/c.js", 10)]).await;
        allocator.manager().spawn_worker().await.unwrap();

        let paths: Vec<PathBuf> = ["/p/a.js", "/p/b.js", "/p/c.js"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let groups = allocator.group_paths_by_worker(&paths).await.unwrap();
        assert_eq!(groups[&0], vec![PathBuf::from("/p/a.js"), PathBuf::from("/p/c.js")]);
        assert_eq!(groups[&1], vec![PathBuf::from("/p/b.js")]);
        allocator.manager().end().await;
    }

    #[tokio::test]
    async fn settled_gate_tracks_both_queues() {
        let allocator = allocator(&[]).await;
        let change = allocator.changed().hold();
        let delete = allocator.deleted().hold();
        assert_eq!(allocator.settled().dependencies(), 2);

        drop(change);
        assert!(allocator.settled().is_locked());
        drop(delete);
        allocator.wait_settled().await;
        assert!(!allocator.settled().is_locked());
        allocator.manager().end().await;
    }
}
