//! filegrid-lock: asynchronous coordination primitives.
//!
//! - [`Locker`] is a keyed async mutex. At most one [`Lock`] per key is
//!   alive at a time, waiters are served strictly FIFO, and releasing hands
//!   the lock directly to the next waiter so a queued key is never
//!   observably free.
//! - [`GlobalLock`] is a reference-counted quiescence gate. Work is
//!   wrapped to bump a counter while it runs; [`GlobalLock::wait`]
//!   resolves when the counter returns to zero. Gates can be attached to a
//!   parent so one wait point covers several independent producers.
//!
//! # Hand-off
//!
//! ```text
//! holder.release()
//!   ├── waiters empty  → remove key from map
//!   └── waiters [A, B] → A receives a fresh Lock, map entry stays
//! ```

pub mod error;
pub mod global;
pub mod locker;

pub use error::{LockError, LockResult};
pub use global::{DependencyGuard, GlobalLock};
pub use locker::{Lock, Locker};
