//! Per-worker records kept by the pool manager.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use filegrid_core::{FileStats, WorkerId};
use filegrid_worker::{WorkerHandle, WorkerKind};

/// Lifecycle of a worker.
///
/// ```text
/// Spawning ──► Ready ──► Ended
///                ▲
/// Ghost ─────────┘  (swapped in under another id)
/// ```
#[derive(Clone)]
pub enum WorkerState {
    /// Reserved in the table; the id lock is held until it is ready.
    Spawning,
    /// Handshake complete, accepting files.
    Ready(Arc<dyn WorkerHandle>),
    /// Running but excluded from assignment.
    Ghost(Arc<dyn WorkerHandle>),
    /// Shut down.
    Ended,
}

impl WorkerState {
    /// Short lowercase name used in logs and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerState::Spawning => "spawning",
            WorkerState::Ready(_) => "ready",
            WorkerState::Ghost(_) => "ghost",
            WorkerState::Ended => "ended",
        }
    }
}

/// A worker and the running totals of the files it owns.
#[derive(Clone)]
pub struct WorkerContainer {
    pub id: WorkerId,
    pub file_count: u64,
    pub byte_count: u64,
    pub state: WorkerState,
}

impl WorkerContainer {
    /// A reserved slot that has not finished spawning.
    pub(crate) fn spawning(id: WorkerId) -> Self {
        Self {
            id,
            file_count: 0,
            byte_count: 0,
            state: WorkerState::Spawning,
        }
    }

    /// The worker's handle, once it has one and until it ends.
    pub fn handle(&self) -> Option<&Arc<dyn WorkerHandle>> {
        match &self.state {
            WorkerState::Ready(handle) | WorkerState::Ghost(handle) => Some(handle),
            WorkerState::Spawning | WorkerState::Ended => None,
        }
    }

    /// Where the worker runs, if it has a handle.
    pub fn kind(&self) -> Option<WorkerKind> {
        self.handle().map(|handle| handle.kind())
    }

    /// Whether the handshake completed and the worker is in service.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, WorkerState::Ready(_))
    }

    /// Whether this is a replacement not yet swapped in.
    pub fn is_ghost(&self) -> bool {
        matches!(self.state, WorkerState::Ghost(_))
    }

    /// Whether new files may be assigned here. A spawning worker counts:
    /// callers wait on its id lock before using it.
    pub fn is_assignable(&self) -> bool {
        matches!(self.state, WorkerState::Spawning | WorkerState::Ready(_))
    }

    /// Add one file of `stats.size` bytes.
    pub(crate) fn own(&mut self, stats: &FileStats) {
        self.file_count += 1;
        self.byte_count += stats.size;
    }

    /// Remove one file of `stats.size` bytes.
    pub(crate) fn disown(&mut self, stats: &FileStats) {
        debug_assert!(self.file_count > 0 && self.byte_count >= stats.size);
        self.file_count = self.file_count.saturating_sub(1);
        self.byte_count = self.byte_count.saturating_sub(stats.size);
    }

    /// Serializable snapshot of this worker.
    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            id: self.id,
            kind: self.kind(),
            state: self.state.label(),
            file_count: self.file_count,
            byte_count: self.byte_count,
        }
    }
}

impl fmt::Debug for WorkerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContainer")
            .field("id", &self.id)
            .field("state", &self.state.label())
            .field("kind", &self.kind())
            .field("file_count", &self.file_count)
            .field("byte_count", &self.byte_count)
            .finish()
    }
}

/// Serializable snapshot of a worker's load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub kind: Option<WorkerKind>,
    pub state: &'static str,
    pub file_count: u64,
    pub byte_count: u64,
}
