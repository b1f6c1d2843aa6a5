//! Priority-aware asynchronous mutex.
//!
//! Ownership is handed off directly from the releasing owner to the
//! highest-priority waiter, so a newly arriving low-priority caller can never
//! slip in between a release and the next grant.

use crate::error::{LockError, LockResult};
use crate::queue::{Priority, PriorityQueue};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Identifier of one granted (or pending) ownership.
pub type OwnerId = u64;

struct Waiter {
    id: OwnerId,
    wake: oneshot::Sender<()>,
}

struct MutexState<P> {
    owner: Option<OwnerId>,
    next_id: OwnerId,
    waiters: PriorityQueue<Waiter, P>,
}

impl<P: PartialEq + Debug> MutexState<P> {
    fn release(&mut self, id: OwnerId) -> bool {
        if self.owner != Some(id) {
            return false;
        }
        self.owner = None;

        while let Some(waiter) = self.waiters.dequeue() {
            self.owner = Some(waiter.id);
            if waiter.wake.send(()).is_ok() {
                tracing::trace!(from = id, to = waiter.id, "mutex handed off");
                return true;
            }
            // Receiver dropped while queued.
            self.owner = None;
        }
        true
    }
}

/// A single-owner async lock whose waiters are served by priority.
///
/// Cloning yields another handle to the same lock.
pub struct PriorityMutex<P = Priority> {
    state: Arc<Mutex<MutexState<P>>>,
}

impl<P> Clone for PriorityMutex<P> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl PriorityMutex<Priority> {
    /// Creates a mutex over [`Priority::ALL`].
    pub fn standard() -> Self {
        Self::from_queue(PriorityQueue::standard())
    }
}

impl<P: PartialEq + Debug + Clone> PriorityMutex<P> {
    /// Creates a mutex whose waiters are ordered by `priorities`, highest first.
    pub fn new(priorities: impl IntoIterator<Item = P>) -> LockResult<Self> {
        Ok(Self::from_queue(PriorityQueue::new(priorities)?))
    }

    fn from_queue(waiters: PriorityQueue<Waiter, P>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MutexState {
                owner: None,
                next_id: 1,
                waiters,
            })),
        }
    }

    /// The priority used when a caller does not name one.
    pub fn lowest_priority(&self) -> P {
        self.state.lock().waiters.lowest().clone()
    }

    /// Waits until this caller owns the mutex.
    ///
    /// Grants immediately if the mutex is free. Dropping the returned future
    /// before it completes withdraws the request; if ownership had already
    /// been handed over it is released again.
    pub async fn acquire(&self, priority: &P) -> LockResult<PriorityMutexGuard<P>> {
        let (id, rx) = {
            let mut state = self.state.lock();
            if !state.waiters.accepts(priority) {
                return Err(LockError::UnknownPriority(format!("{:?}", priority)));
            }

            let id = state.next_id;
            state.next_id += 1;

            if state.owner.is_none() {
                state.owner = Some(id);
                return Ok(self.guard(id));
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.enqueue(Waiter { id, wake: tx }, priority)?;
            (id, rx)
        };

        let mut pending = PendingAcquire {
            state: Arc::clone(&self.state),
            id,
            armed: true,
        };
        rx.await.map_err(|_| LockError::Abandoned)?;
        pending.armed = false;

        Ok(self.guard(id))
    }

    /// Acquires at the lowest priority.
    pub async fn acquire_lowest(&self) -> LockResult<PriorityMutexGuard<P>> {
        let priority = self.lowest_priority();
        self.acquire(&priority).await
    }

    /// Releases ownership held by `owner`.
    ///
    /// A no-op unless `owner` is the current owner.
    pub fn release(&self, owner: OwnerId) {
        self.state.lock().release(owner);
    }

    /// Runs `f` while holding the mutex.
    ///
    /// The mutex is released when `f` returns, fails, panics or its future is
    /// dropped.
    pub async fn run_exclusive<F, Fut, T, E>(&self, priority: &P, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let _guard = self.acquire(priority).await?;
        f().await
    }

    /// Returns true if some caller currently owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Current owner, if any.
    pub fn owner(&self) -> Option<OwnerId> {
        self.state.lock().owner
    }

    /// Number of callers waiting for ownership.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn guard(&self, id: OwnerId) -> PriorityMutexGuard<P> {
        PriorityMutexGuard {
            state: Arc::clone(&self.state),
            id,
            released: false,
        }
    }
}

impl<P: PartialEq + Debug> Debug for PriorityMutex<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PriorityMutex")
            .field("owner", &state.owner)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// Withdraws a queued request if the acquire future is dropped.
struct PendingAcquire<P: PartialEq + Debug> {
    state: Arc<Mutex<MutexState<P>>>,
    id: OwnerId,
    armed: bool,
}

impl<P: PartialEq + Debug> Drop for PendingAcquire<P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        let id = self.id;
        if state.owner == Some(id) {
            // Granted, but nobody will ever see the guard.
            state.release(id);
        } else {
            state.waiters.remove_first(|w| w.id == id);
        }
    }
}

/// Ownership of a [`PriorityMutex`].
///
/// Released on drop; [`release`](Self::release) may be called earlier and
/// any number of times.
pub struct PriorityMutexGuard<P: PartialEq + Debug = Priority> {
    state: Arc<Mutex<MutexState<P>>>,
    id: OwnerId,
    released: bool,
}

impl<P: PartialEq + Debug> PriorityMutexGuard<P> {
    /// The owner id this guard was granted under.
    pub fn owner_id(&self) -> OwnerId {
        self.id
    }

    /// Releases ownership. Later calls do nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.state.lock().release(self.id);
    }

    /// Returns true once [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl<P: PartialEq + Debug> Drop for PriorityMutexGuard<P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<P: PartialEq + Debug> Debug for PriorityMutexGuard<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityMutexGuard")
            .field("owner_id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn wait_for_waiters(mutex: &PriorityMutex, n: usize) {
        while mutex.waiting() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn immediate_grant_when_free() {
        let mutex = PriorityMutex::standard();
        assert!(!mutex.is_locked());

        let guard = mutex.acquire(&Priority::Low).await.unwrap();
        assert!(mutex.is_locked());
        assert_eq!(mutex.owner(), Some(guard.owner_id()));

        drop(guard);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn unknown_priority_is_rejected() {
        let mutex = PriorityMutex::new(["a", "b"]).unwrap();
        let err = mutex.acquire(&"c").await.unwrap_err();
        assert_eq!(err, LockError::UnknownPriority("\"c\"".into()));
        assert!(!mutex.is_locked());
        assert_eq!(mutex.lowest_priority(), "b");
    }

    #[tokio::test]
    async fn high_priority_waiter_wins_handoff() {
        let mutex = PriorityMutex::standard();
        let mut holder = mutex.acquire(&Priority::Normal).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let low = {
            let mutex = mutex.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _g = mutex.acquire(&Priority::Low).await.unwrap();
                tx.send("low").unwrap();
            })
        };
        wait_for_waiters(&mutex, 1).await;

        let high = {
            let mutex = mutex.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _g = mutex.acquire(&Priority::High).await.unwrap();
                tx.send("high").unwrap();
            })
        };
        wait_for_waiters(&mutex, 2).await;

        holder.release();
        low.await.unwrap();
        high.await.unwrap();

        assert_eq!(rx.recv().await, Some("high"));
        assert_eq!(rx.recv().await, Some("low"));
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_owner_only() {
        let mutex = PriorityMutex::standard();
        let mut first = mutex.acquire(&Priority::Low).await.unwrap();

        // Non-owner release does nothing.
        mutex.release(first.owner_id() + 100);
        assert_eq!(mutex.owner(), Some(first.owner_id()));

        let second = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.acquire(&Priority::Low).await.unwrap().owner_id() })
        };
        wait_for_waiters(&mutex, 1).await;

        first.release();
        let second_id = second.await.unwrap();
        assert!(first.is_released());

        // The second guard was dropped inside the task.
        first.release();
        mutex.release(first.owner_id());
        assert_ne!(second_id, first.owner_id());
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn dropped_waiter_is_skipped() {
        let mutex = PriorityMutex::standard();
        let holder = mutex.acquire(&Priority::Low).await.unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), mutex.acquire(&Priority::High)).await;
        assert!(timed_out.is_err());
        assert_eq!(mutex.waiting(), 0);

        drop(holder);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn run_exclusive_releases_on_error() {
        let mutex = PriorityMutex::standard();

        let result: Result<(), LockError> = mutex
            .run_exclusive(&Priority::Normal, || async { Err(LockError::Abandoned) })
            .await;
        assert!(result.is_err());
        assert!(!mutex.is_locked());

        let value: Result<u32, LockError> = mutex
            .run_exclusive(&Priority::Normal, || async { Ok(7) })
            .await;
        assert_eq!(value.unwrap(), 7);
        assert!(!mutex.is_locked());
    }

    async fn explode() -> Result<(), LockError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn run_exclusive_releases_on_panic() {
        let mutex = PriorityMutex::standard();
        let task = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _ = mutex.run_exclusive(&Priority::High, explode).await;
            })
        };
        assert!(task.await.is_err());
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn waiters_serialize() {
        let mutex = PriorityMutex::standard();
        let counter = Arc::new(Mutex::new((0u32, 0u32)));
        let mut tasks = Vec::new();

        for i in 0..16 {
            let mutex = mutex.clone();
            let counter = Arc::clone(&counter);
            let priority = Priority::ALL[i % 3];
            tasks.push(tokio::spawn(async move {
                let _g = mutex.acquire(&priority).await.unwrap();
                {
                    let mut c = counter.lock();
                    c.0 += 1;
                    c.1 = c.1.max(c.0);
                }
                tokio::task::yield_now().await;
                counter.lock().0 -= 1;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(counter.lock().1, 1);
        assert!(!mutex.is_locked());
    }
}
