//! Per-key mutual exclusion with FIFO fairness.
//!
//! [`KeyedLock`] hands out at most one [`LockGuard`] per key at a time.
//! Waiters are woken in request order, so two sync attempts for the same
//! document cannot interleave and a flood of writers makes progress fairly.

use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    hash::Hash,
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

type LockMap<K> = Arc<Mutex<HashMap<K, Waiters<K>>>>;

/// A set of async locks, one per key.
///
/// `acquire` never fails; it only ever suspends until the current holder
/// releases. Keys with no holder and no waiters occupy no memory.
#[derive(Debug)]
pub struct KeyedLock<K: Eq + Hash> {
    inner: LockMap<K>,
}

#[derive(Debug)]
struct Waiters<K: Eq + Hash> {
    queue: VecDeque<oneshot::Sender<Grant<K>>>,
}

impl<K: Eq + Hash> Default for Waiters<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

/// Ownership token a releaser hands to the next waiter.
///
/// A waiter that receives the grant owns the lock. If the waiter's acquire
/// future is dropped before it ever sees the token, the token's own drop
/// passes the key on, so a cancelled waiter cannot strand the lock.
#[derive(Debug)]
struct Grant<K: Eq + Hash> {
    key: Option<K>,
    inner: LockMap<K>,
}

impl<K: Eq + Hash> Grant<K> {
    /// Take over ownership, preventing the drop hand-off.
    fn disarm(mut self) -> Option<K> {
        self.key.take()
    }
}

impl<K: Eq + Hash> Drop for Grant<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            release_key(&self.inner, key);
        }
    }
}

fn release_key<K: Eq + Hash>(inner: &LockMap<K>, mut key: K) {
    let mut map = inner.lock();
    let Some(waiters) = map.get_mut(&key) else {
        return;
    };
    loop {
        match waiters.queue.pop_front() {
            Some(tx) => {
                let grant = Grant {
                    key: Some(key),
                    inner: inner.clone(),
                };
                match tx.send(grant) {
                    Ok(()) => return,
                    // The waiter is already gone; reclaim the key and try
                    // the next one.
                    Err(grant) => match grant.disarm() {
                        Some(reclaimed) => key = reclaimed,
                        None => return,
                    },
                }
            }
            None => {
                map.remove(&key);
                return;
            }
        }
    }
}

impl<K: Eq + Hash> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash> Default for KeyedLock<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    /// Create an empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, suspending while another guard is live.
    pub async fn acquire(&self, key: K) -> LockGuard<K> {
        let wait = {
            let mut map = self.inner.lock();
            match map.entry(key.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(Waiters::default());
                    None
                }
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().queue.push_back(tx);
                    Some(rx)
                }
            }
        };
        if let Some(rx) = wait {
            // Receiving the grant makes the lock ours; disarming it hands
            // ownership to the guard below.
            if let Ok(grant) = rx.await {
                grant.disarm();
            }
        }
        LockGuard {
            key: Some(key),
            inner: self.inner.clone(),
        }
    }

    #[cfg(test)]
    fn held_keys(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Guard for one key of a [`KeyedLock`].
///
/// Dropping the guard releases the lock; [`LockGuard::release`] does the
/// same explicitly and is idempotent.
#[derive(Debug)]
pub struct LockGuard<K: Eq + Hash> {
    key: Option<K>,
    inner: LockMap<K>,
}

impl<K: Eq + Hash> LockGuard<K> {
    /// Release the lock, waking the next waiter in request order.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(key) = self.key.take() {
            release_key(&self.inner, key);
        }
    }
}

impl<K: Eq + Hash> Drop for LockGuard<K> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        pin::pin,
        sync::atomic::{AtomicUsize, Ordering},
        task::{Context, Poll, Waker},
    };

    use super::*;

    fn poll_once<F: Future>(fut: &mut std::pin::Pin<&mut F>) -> Poll<F::Output> {
        let mut cx = Context::from_waker(Waker::noop());
        fut.as_mut().poll(&mut cx)
    }

    #[tokio::test]
    async fn test_exclusive() {
        let locks = KeyedLock::new();
        let guard = locks.acquire("a").await;
        let second = tokio::spawn({
            let locks = locks.clone();
            async move {
                let _guard = locks.acquire("a").await;
            }
        });
        tokio::task::yield_now().await;
        assert!(!second.is_finished());
        guard.release();
        second.await.unwrap();
        assert_eq!(locks.held_keys(), 0);
    }

    #[tokio::test]
    async fn test_release_idempotent() {
        let locks = KeyedLock::new();
        let guard = locks.acquire(1u8).await;
        guard.release();
        // A fresh acquire after release must succeed immediately.
        let guard = locks.acquire(1u8).await;
        drop(guard);
        assert_eq!(locks.held_keys(), 0);
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_block() {
        let locks = KeyedLock::new();
        let _a = locks.acquire("a").await;
        let _b = locks.acquire("b").await;
    }

    #[tokio::test]
    async fn test_fifo_wake_order() {
        let locks = KeyedLock::new();
        let holder = locks.acquire("doc").await;

        // Enqueue two waiters in a known order.
        let mut first = pin!(locks.acquire("doc"));
        let mut second = pin!(locks.acquire("doc"));
        assert!(poll_once(&mut first).is_pending());
        assert!(poll_once(&mut second).is_pending());

        holder.release();
        // Only the first waiter may proceed.
        assert!(poll_once(&mut second).is_pending());
        let first_guard = match poll_once(&mut first) {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!("first waiter not woken"),
        };
        assert!(poll_once(&mut second).is_pending());
        first_guard.release();
        assert!(poll_once(&mut second).is_ready());
    }

    #[tokio::test]
    async fn test_waiter_dropped_after_release_frees_key() {
        let locks = KeyedLock::new();
        let holder = locks.acquire("doc").await;
        {
            let mut waiter = pin!(locks.acquire("doc"));
            assert!(poll_once(&mut waiter).is_pending());
            // The release signals this waiter, but it is dropped without
            // ever being polled again.
            holder.release();
        }
        // The key must not stay locked forever.
        let mut next = pin!(locks.acquire("doc"));
        let guard = match poll_once(&mut next) {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!("lock stranded by cancelled waiter"),
        };
        guard.release();
        assert_eq!(locks.held_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let locks = KeyedLock::new();
        let holder = locks.acquire("doc").await;
        {
            let mut cancelled = pin!(locks.acquire("doc"));
            assert!(poll_once(&mut cancelled).is_pending());
            // Dropped before ever being woken.
        }
        let mut live = pin!(locks.acquire("doc"));
        assert!(poll_once(&mut live).is_pending());
        holder.release();
        assert!(poll_once(&mut live).is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_in_flight() {
        let locks = KeyedLock::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..32usize {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            tasks.push(tokio::spawn(async move {
                let guard = locks.acquire("doc").await;
                assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                guard.release();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(locks.held_keys(), 0);
    }
}
