//! Reference-counted quiescence gate.
//!
//! A [`GlobalLock`] counts in-flight operations. Every change to the count
//! is mirrored into the gates it has been attached to, so a parent gate
//! reflects the combined pending work of its children without the children
//! knowing about it. Attachments must form a DAG.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Clone, Default)]
pub struct GlobalLock {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    dependencies: usize,
    waiters: Vec<oneshot::Sender<()>>,
    parents: Vec<Weak<GateInner>>,
}

/// One unit of pending work on a [`GlobalLock`]. Dropping it decrements.
#[must_use = "dropping a DependencyGuard decrements the gate immediately"]
pub struct DependencyGuard {
    inner: Arc<GateInner>,
}

impl GlobalLock {
    /// An unlocked gate with no parents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of pending operations.
    pub fn dependencies(&self) -> usize {
        self.inner.state.lock().dependencies
    }

    /// Whether any operation is pending.
    pub fn is_locked(&self) -> bool {
        self.dependencies() > 0
    }

    /// Count one pending operation until the guard is dropped.
    pub fn hold(&self) -> DependencyGuard {
        self.inner.add(1);
        DependencyGuard {
            inner: self.inner.clone(),
        }
    }

    /// Run `fut` as a pending operation. The count is decremented however
    /// `fut` finishes.
    pub async fn wrap<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        let _guard = self.hold();
        fut.await
    }

    /// Resolve once no operations are pending.
    pub async fn wait(&self) {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.dependencies == 0 {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Mirror `other`'s pending count into this gate, now and from here on.
    pub fn attach_lock(&self, other: &GlobalLock) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        // Child before parent, the same order count changes propagate in.
        let mut child = other.inner.state.lock();
        child.parents.push(Arc::downgrade(&self.inner));
        if child.dependencies > 0 {
            self.inner.add(child.dependencies);
        }
    }
}

impl GateInner {
    fn add(&self, n: usize) {
        let mut state = self.state.lock();
        state.dependencies += n;
        trace!(dependencies = state.dependencies, "gate incremented");
        state.parents.retain(|parent| match parent.upgrade() {
            Some(parent) => {
                parent.add(n);
                true
            }
            None => false,
        });
    }

    fn sub(&self, n: usize) {
        let released = {
            let mut state = self.state.lock();
            debug_assert!(state.dependencies >= n, "gate decremented below zero");
            state.dependencies = state.dependencies.saturating_sub(n);
            state.parents.retain(|parent| match parent.upgrade() {
                Some(parent) => {
                    parent.sub(n);
                    true
                }
                None => false,
            });
            if state.dependencies == 0 {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            }
        };

        if !released.is_empty() {
            trace!(waiters = released.len(), "gate drained");
        }
        for waiter in released {
            let _ = waiter.send(());
        }
    }
}

impl Drop for DependencyGuard {
    fn drop(&mut self) {
        self.inner.sub(1);
    }
}

impl fmt::Debug for GlobalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalLock")
            .field("dependencies", &self.dependencies())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn resolves(gate: &GlobalLock) -> bool {
        tokio::time::timeout(Duration::from_millis(20), gate.wait())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn wait_resolves_immediately_when_idle() {
        let gate = GlobalLock::new();
        assert!(!gate.is_locked());
        assert!(resolves(&gate).await);
    }

    #[tokio::test]
    async fn wrap_counts_while_running() {
        let gate = GlobalLock::new();
        let (tx, rx) = oneshot::channel::<()>();

        let task = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wrap(async { rx.await.is_ok() }).await })
        };
        while !gate.is_locked() {
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.dependencies(), 1);
        assert!(!resolves(&gate).await);

        tx.send(()).unwrap();
        assert!(task.await.unwrap());
        assert_eq!(gate.dependencies(), 0);
        assert!(resolves(&gate).await);
    }

    #[tokio::test]
    async fn wrap_decrements_on_error() {
        let gate = GlobalLock::new();
        let result: Result<(), &str> = gate.wrap(async { Err("nope") }).await;
        assert!(result.is_err());
        assert!(!gate.is_locked());
    }

    #[tokio::test]
    async fn all_waiters_release_on_same_zero_crossing() {
        let gate = GlobalLock::new();
        let first = gate.hold();
        let second = gate.hold();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;

        drop(first);
        tokio::task::yield_now().await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        drop(second);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_millis(100), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn parent_waits_for_every_attached_child() {
        let changed = GlobalLock::new();
        let deleted = GlobalLock::new();
        let settled = GlobalLock::new();
        settled.attach_lock(&changed);
        settled.attach_lock(&deleted);

        let c1 = changed.hold();
        let d1 = deleted.hold();
        let c2 = changed.hold();
        assert_eq!(settled.dependencies(), 3);

        drop(c1);
        drop(d1);
        assert!(!deleted.is_locked());
        assert!(!resolves(&settled).await);

        drop(c2);
        assert!(resolves(&settled).await);
        assert_eq!(settled.dependencies(), 0);
    }

    #[tokio::test]
    async fn attach_imports_pending_count() {
        let child = GlobalLock::new();
        let parent = GlobalLock::new();
        let pending = child.hold();

        parent.attach_lock(&child);
        assert_eq!(parent.dependencies(), 1);

        drop(pending);
        assert_eq!(parent.dependencies(), 0);
        assert!(resolves(&parent).await);
    }

    #[tokio::test]
    async fn parent_own_work_counts_alongside_children() {
        let child = GlobalLock::new();
        let parent = GlobalLock::new();
        parent.attach_lock(&child);

        let own = parent.hold();
        let from_child = child.hold();
        drop(from_child);
        assert!(!resolves(&parent).await);
        drop(own);
        assert!(resolves(&parent).await);
    }

    #[tokio::test]
    async fn dropped_parent_is_forgotten() {
        let child = GlobalLock::new();
        {
            let parent = GlobalLock::new();
            parent.attach_lock(&child);
        }
        let guard = child.hold();
        drop(guard);
        assert_eq!(child.inner.state.lock().parents.len(), 0);
    }
}
