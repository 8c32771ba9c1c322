//! filegrid-worker: worker execution contexts.
//!
//! A worker is reachable only through asynchronous message passing. The
//! scheduler talks to every worker through [`WorkerHandle`], so the
//! in-process worker and a dedicated one are interchangeable behind the
//! same id.
//!
//! # Architecture
//!
//! ```text
//! ChannelWorker (client, implements WorkerHandle)
//!   ├── mpsc request queue ──► serve loop ──► WorkerService::handle
//!   │                            ├── in-process: task on the caller's runtime
//!   │                            └── dedicated: own thread + current-thread runtime
//!   └── EventBus ◄── WorkerContext::emit
//! ```

pub mod channel;
pub mod error;
pub mod handle;
pub mod protocol;
pub mod service;
pub mod spawn;

pub use channel::{ChannelWorker, DEFAULT_END_GRACE};
pub use error::{WorkerError, WorkerResult};
pub use handle::{EventHandler, WorkerHandle, WorkerKind};
pub use service::{FileWorker, WorkerContext, WorkerService};
pub use spawn::{ThreadSpawner, WorkerSpawner};
