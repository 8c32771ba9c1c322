//! File-stats collaborators.
//!
//! The scheduler asks for a file's size before assigning it. Stats may be
//! queried while a watch root is still being crawled, so "no stats yet" and
//! "no such file" are different answers: callers first
//! [`wait_if_initializing_watch`](FileStatsProvider::wait_if_initializing_watch)
//! and only then treat an absent entry as missing.

use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::types::{FileStats, is_within, normalize_path};

#[async_trait]
pub trait FileStatsProvider: Send + Sync {
    /// Stats for `path`, or `None` when unknown.
    fn get_file_stats(&self, path: &Path) -> Option<FileStats>;

    /// Resolve once every watch root containing `path` has finished its
    /// initial crawl. Returns immediately when no such crawl is running.
    async fn wait_if_initializing_watch(&self, path: &Path);
}

/// A stats table populated by hand. Never initializing.
#[derive(Debug, Default)]
pub struct MemoryFileStats {
    files: RwLock<HashMap<String, FileStats>>,
}

impl MemoryFileStats {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or replace the stats for `path`.
    pub fn insert(&self, path: &Path, stats: FileStats) {
        self.files.write().insert(normalize_path(path), stats);
    }

    /// Forget `path`, returning its last stats.
    pub fn remove(&self, path: &Path) -> Option<FileStats> {
        self.files.write().remove(&normalize_path(path))
    }

    /// Number of known files.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Whether no files are known.
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

#[async_trait]
impl FileStatsProvider for MemoryFileStats {
    fn get_file_stats(&self, path: &Path) -> Option<FileStats> {
        self.files.read().get(&normalize_path(path)).copied()
    }

    async fn wait_if_initializing_watch(&self, _path: &Path) {}
}

/// Stats gathered by walking watch roots on disk.
///
/// Each root carries a readiness flag that flips once its crawl finishes;
/// lookups under a root that is still crawling can wait on it.
#[derive(Debug, Default)]
pub struct CrawledFileStats {
    files: RwLock<HashMap<String, FileStats>>,
    roots: RwLock<Vec<(String, watch::Receiver<bool>)>>,
}

impl CrawledFileStats {
    /// An empty table with no watch roots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `root` as initializing. Dropping or signalling the returned
    /// sender marks it ready.
    pub fn begin_watch(&self, root: &Path) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        let root = normalize_path(root);
        let mut roots = self.roots.write();
        roots.retain(|(existing, _)| *existing != root);
        roots.push((root, rx));
        tx
    }

    /// Walk `root`, recording stats for every regular file. Blocking.
    pub fn crawl(&self, root: &Path) -> anyhow::Result<usize> {
        let ready = self.begin_watch(root);
        info!(root = %root.display(), "crawling watch root");

        let mut count = 0;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry.metadata()?;
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or_default();
            self.record(entry.path(), FileStats::new(metadata.len(), mtime));
            count += 1;
        }

        let _ = ready.send(true);
        info!(root = %root.display(), files = count, "watch root ready");
        Ok(count)
    }

    /// Record or replace the stats for `path`.
    pub fn record(&self, path: &Path, stats: FileStats) {
        self.files.write().insert(normalize_path(path), stats);
    }

    /// Forget `path`, returning its last stats.
    pub fn remove(&self, path: &Path) -> Option<FileStats> {
        self.files.write().remove(&normalize_path(path))
    }

    /// Every known file, sorted by path.
    pub fn files(&self) -> Vec<(String, FileStats)> {
        let mut files: Vec<_> = self
            .files
            .read()
            .iter()
            .map(|(path, stats)| (path.clone(), *stats))
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files
    }
}

#[async_trait]
impl FileStatsProvider for CrawledFileStats {
    fn get_file_stats(&self, path: &Path) -> Option<FileStats> {
        self.files.read().get(&normalize_path(path)).copied()
    }

    async fn wait_if_initializing_watch(&self, path: &Path) {
        let path = normalize_path(path);
        let pending: Vec<watch::Receiver<bool>> = self
            .roots
            .read()
            .iter()
            .filter(|(root, rx)| is_within(&path, root) && !*rx.borrow())
            .map(|(_, rx)| rx.clone())
            .collect();

        for mut rx in pending {
            debug!(%path, "waiting for watch root to finish crawling");
            // A dropped sender means the crawl is over, successful or not.
            let _ = rx.wait_for(|ready| *ready).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn memory_stats_lookup_normalizes() {
        let stats = MemoryFileStats::new();
        stats.insert(Path::new("/p/src/a.js"), FileStats::with_size(10));
        assert_eq!(
            stats.get_file_stats(Path::new("/p/src/../src/a.js")),
            Some(FileStats::with_size(10))
        );
        stats.wait_if_initializing_watch(Path::new("/p/src/a.js")).await;
        assert_eq!(stats.remove(Path::new("/p/src/a.js")).map(|s| s.size), Some(10));
        assert!(stats.is_empty());
    }

    #[test]
    fn crawl_records_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.js"), "let a = 1;\n").unwrap();
        std::fs::write(dir.path().join("b.js"), "b").unwrap();

        let stats = CrawledFileStats::new();
        assert_eq!(stats.crawl(dir.path()).unwrap(), 2);
        assert_eq!(
            stats.get_file_stats(&dir.path().join("src/a.js")).map(|s| s.size),
            Some(11)
        );
        assert_eq!(stats.files().len(), 2);
    }

    #[tokio::test]
    async fn wait_blocks_until_root_is_ready() {
        let stats = Arc::new(CrawledFileStats::new());
        let ready = stats.begin_watch(Path::new("/w"));

        let waiter = {
            let stats = stats.clone();
            tokio::spawn(async move {
                stats.wait_if_initializing_watch(Path::new("/w/a.js")).await;
                stats.get_file_stats(Path::new("/w/a.js"))
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        stats.record(Path::new("/w/a.js"), FileStats::with_size(3));
        ready.send(true).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(FileStats::with_size(3)));
    }

    #[tokio::test]
    async fn paths_outside_initializing_roots_do_not_wait() {
        let stats = CrawledFileStats::new();
        let _ready = stats.begin_watch(Path::new("/w"));
        tokio::time::timeout(
            Duration::from_millis(100),
            stats.wait_if_initializing_watch(Path::new("/other/a.js")),
        )
        .await
        .unwrap();
    }
}
