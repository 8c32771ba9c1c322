//! Shared types used across filegrid crates.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// Identifier of a worker in the pool.
pub type WorkerId = u32;

/// The worker that initially runs in-process. The id survives the later
/// swap to a dedicated worker.
pub const OWN_WORKER_ID: WorkerId = 0;

/// Size and modification time of a file, as known to the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    /// File size in bytes.
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: u64,
}

impl FileStats {
    /// Stats for a file of `size` bytes last modified at `mtime` (Unix seconds).
    pub fn new(size: u64, mtime: u64) -> Self {
        Self { size, mtime }
    }

    /// Stats for a file of `size` bytes with no known mtime.
    pub fn with_size(size: u64) -> Self {
        Self { size, mtime: 0 }
    }
}

/// Lexically normalize a path into the canonical string used as a map key.
///
/// `.` components are dropped, `..` consumes the previous component where
/// one exists, and separators are always `/`. The filesystem is never
/// consulted, so symlinks are not resolved.
pub fn normalize_path(path: &Path) -> String {
    let mut prefix = String::new();
    let mut absolute = false;
    let mut parts: Vec<String> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(p) => prefix = p.as_os_str().to_string_lossy().replace('\\', "/"),
            Component::RootDir => absolute = true,
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(last) if last != ".." => {
                    parts.pop();
                }
                // `/..` is `/`.
                _ if absolute => {}
                _ => parts.push("..".to_string()),
            },
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("{prefix}/{joined}")
    } else if joined.is_empty() {
        if prefix.is_empty() { ".".to_string() } else { prefix }
    } else {
        format!("{prefix}{joined}")
    }
}

/// Whether the normalized `path` is `root` or lies underneath it.
pub fn is_within(path: &str, root: &str) -> bool {
    if root == "/" {
        return path.starts_with('/');
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}
