//! filegrid-scheduler: decides which worker owns which file.
//!
//! The [`WorkerManager`] owns the pool: worker 0 starts in-process, is
//! moved to a dedicated worker once it owns too many bytes, and further
//! workers are spawned when the least-loaded one crosses a threshold. The
//! [`FileAllocator`] owns the path → worker mapping and is the only place a
//! path is first assigned.
//!
//! # Architecture
//!
//! ```text
//! FileAllocator
//!   ├── Locker<Path>          (serializes first assignment per path)
//!   ├── ownership map         (path → worker id + accounted size)
//!   ├── GlobalLock changed / deleted → settled
//!   └── WorkerManager
//!       ├── Locker<WorkerId>  (spawn / replace / "is this id safe yet?")
//!       ├── worker table      (WorkerContainer per id, least-loaded scan)
//!       ├── WorkerSpawner     (in-process + dedicated workers)
//!       └── WorkerWatchdog    (heartbeats → fatal sink)
//! ```
//!
//! Two lock domains: the path locker decides *which* worker a path gets,
//! exactly once; the worker-id locker decides whether a worker id can be
//! handed out at all while it is spawning or being swapped.

pub mod allocator;
pub mod container;
pub mod error;
pub mod manager;

pub use allocator::{FileAllocator, FilePathLocker, Ownership};
pub use container::{WorkerContainer, WorkerState, WorkerSummary};
pub use error::{FatalSink, SchedulerError, SchedulerResult, log_fatal_sink};
pub use manager::{WorkerLocker, WorkerManager};
