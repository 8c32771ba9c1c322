//! Lock error types.

use thiserror::Error;

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// A fresh lock was requested for a key that is already held. This is a
    /// scheduling bug, never a user-facing condition.
    #[error("lock invariant violated: key {key} is already locked")]
    AlreadyLocked { key: String },
}
