//! Keyed asynchronous mutex.
//!
//! A [`Locker`] maps normalized keys to live locks. A key has a map entry
//! exactly while it is held or has queued waiters. Each entry is the FIFO
//! queue of waiters; the holder is implied by the entry existing.
//!
//! Releasing never unlocks a contended key: the next waiter is sent a
//! freshly minted [`Lock`] through its oneshot channel. If that waiter has
//! gone away, the lock comes back and is offered to the one after it.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{LockError, LockResult};

/// Bounds a normalized key has to satisfy.
pub trait LockKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> LockKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

type Normalizer<K, N> = Arc<dyn Fn(&K) -> N + Send + Sync>;
type Waiters<N> = VecDeque<oneshot::Sender<Lock<N>>>;

/// A keyed async mutex over keys of type `K`, stored as normalized `N`.
pub struct Locker<K: ?Sized, N: LockKey> {
    normalize: Normalizer<K, N>,
    inner: Arc<LockerInner<N>>,
}

struct LockerInner<N: LockKey> {
    locks: Mutex<HashMap<N, Waiters<N>>>,
}

/// Exclusive ownership of one key. Released on [`release`](Lock::release)
/// or drop.
#[must_use = "dropping a Lock releases it immediately"]
pub struct Lock<N: LockKey> {
    key: N,
    locker: Arc<LockerInner<N>>,
    armed: bool,
}

impl<N: LockKey> Locker<N, N> {
    /// A locker whose keys are used as-is.
    pub fn identity() -> Self {
        Self::new(|key: &N| key.clone())
    }
}

impl<K: ?Sized, N: LockKey> Locker<K, N> {
    /// Create a locker that maps every key through `normalize` first.
    pub fn new(normalize: impl Fn(&K) -> N + Send + Sync + 'static) -> Self {
        Self {
            normalize: Arc::new(normalize),
            inner: Arc::new(LockerInner {
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The normalized form `key` is locked under.
    pub fn normalize_key(&self, key: &K) -> N {
        (self.normalize)(key)
    }

    /// Whether `key` is currently held or queued on.
    pub fn has_lock(&self, key: &K) -> bool {
        let key = self.normalize_key(key);
        self.inner.locks.lock().contains_key(&key)
    }

    /// Number of callers queued behind the holder of `key`.
    pub fn waiting_count(&self, key: &K) -> usize {
        let key = self.normalize_key(key);
        self.inner.locks.lock().get(&key).map_or(0, VecDeque::len)
    }

    /// Number of keys currently held.
    pub fn locked_count(&self) -> usize {
        self.inner.locks.lock().len()
    }

    /// Take the lock for `key` synchronously, failing if anyone holds it.
    pub fn get_new_lock(&self, key: &K) -> LockResult<Lock<N>> {
        let key = self.normalize_key(key);
        let mut locks = self.inner.locks.lock();
        match locks.entry(key.clone()) {
            Entry::Occupied(_) => Err(LockError::AlreadyLocked {
                key: format!("{key:?}"),
            }),
            Entry::Vacant(entry) => {
                entry.insert(VecDeque::new());
                Ok(Lock::new(key, self.inner.clone()))
            }
        }
    }

    /// Acquire the lock for `key`, queueing behind the current holder.
    pub async fn get_lock(&self, key: &K) -> Lock<N> {
        let key = self.normalize_key(key);
        LockerInner::acquire(&self.inner, key).await
    }

    /// Wait for the current holder of `key` to release it. Does not wait
    /// for callers that queue up afterwards.
    pub async fn wait_lock(&self, key: &K) {
        let key = self.normalize_key(key);
        if !self.inner.locks.lock().contains_key(&key) {
            return;
        }
        LockerInner::acquire(&self.inner, key).await.release();
    }

    /// Wait until `key` is completely unlocked, including callers that
    /// queue up while we wait.
    pub async fn wait_lock_drained(&self, key: &K) {
        let key = self.normalize_key(key);
        while self.inner.locks.lock().contains_key(&key) {
            LockerInner::acquire(&self.inner, key.clone()).await.release();
        }
    }

    /// Run `fut` while holding the lock for `key`. The lock is released
    /// however `fut` finishes, including by panic or cancellation.
    pub async fn wrap_lock<F>(&self, key: &K, fut: F) -> F::Output
    where
        F: Future,
    {
        let _lock = self.get_lock(key).await;
        fut.await
    }
}

impl<K: ?Sized, N: LockKey> Clone for Locker<K, N> {
    fn clone(&self) -> Self {
        Self {
            normalize: self.normalize.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<K: ?Sized, N: LockKey> Debug for Locker<K, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locker")
            .field("locked", &self.locked_count())
            .finish()
    }
}

impl<N: LockKey> LockerInner<N> {
    async fn acquire(self: &Arc<Self>, key: N) -> Lock<N> {
        loop {
            let waiter = {
                let mut locks = self.locks.lock();
                match locks.entry(key.clone()) {
                    Entry::Vacant(entry) => {
                        entry.insert(VecDeque::new());
                        return Lock::new(key, self.clone());
                    }
                    Entry::Occupied(mut entry) => {
                        let (tx, rx) = oneshot::channel();
                        entry.get_mut().push_back(tx);
                        rx
                    }
                }
            };

            trace!(?key, "queued for lock");
            // A sender is only ever dropped unsent if the hand-off raced a
            // teardown; queue again rather than hang.
            if let Ok(lock) = waiter.await {
                return lock;
            }
        }
    }

    fn release(self: &Arc<Self>, key: &N) {
        loop {
            let waiter = {
                let mut locks = self.locks.lock();
                let Some(waiters) = locks.get_mut(key) else {
                    return;
                };
                match waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        locks.remove(key);
                        trace!(?key, "lock released");
                        return;
                    }
                }
            };

            // Sent outside the map mutex: a lock dropped by a vanished
            // receiver re-enters `release`.
            match waiter.send(Lock::new(key.clone(), self.clone())) {
                Ok(()) => {
                    trace!(?key, "lock handed off");
                    return;
                }
                Err(mut orphan) => orphan.armed = false,
            }
        }
    }
}

impl<N: LockKey> Lock<N> {
    fn new(key: N, locker: Arc<LockerInner<N>>) -> Self {
        Self {
            key,
            locker,
            armed: true,
        }
    }

    /// The normalized key this lock holds.
    pub fn key(&self) -> &N {
        &self.key
    }

    /// Release the lock, handing it to the earliest waiter if there is one.
    pub fn release(self) {
        drop(self);
    }
}

impl<N: LockKey> Drop for Lock<N> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.locker.release(&self.key);
        }
    }
}

impl<N: LockKey> Debug for Lock<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("key", &self.key).finish()
    }
}
