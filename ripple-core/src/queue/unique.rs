//! Keyed Unique Queue
//!
//! Each key holds at most one pending task. Pushing a task for a key that
//! already has a pending (not yet started) task replaces it: the old task is
//! dropped without running and its completion resolves to
//! [`Error::Superseded`]. A task that has already started is never
//! interrupted; only the next slot for its key is coalesced.
//!
//! Every key has its own worker, so keys never wait on each other. A delay
//! precedes every run, which gives bursts of pushes for one key time to
//! collapse into a single run.

use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::completion::Completion;
use crate::config::QueueConfig;
use crate::error::Error;

struct Slot {
    // Boxed futures are `Send` but not `Sync`; the mutex makes the slot
    // shareable through the map.
    pending: Mutex<Option<BoxFuture<'static, ()>>>,
}

struct Inner<K: Eq + Hash> {
    delay: Duration,
    /// A key has an entry exactly while its worker is alive.
    slots: DashMap<K, Slot>,
}

/// Per-key coalescing task queue.
///
/// # Example
///
/// ```rust,ignore
/// let queue = UniqueQueue::new(Duration::from_millis(10));
///
/// let stale = queue.push("search", async { query("r").await });
/// let fresh = queue.push("search", async { query("ru").await });
///
/// assert!(stale.await.is_err()); // superseded, never ran
/// let hits = fresh.await?;
/// ```
pub struct UniqueQueue<K: Eq + Hash> {
    inner: Arc<Inner<K>>,
}

impl<K> UniqueQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a queue that waits `delay` before every run.
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                delay,
                slots: DashMap::new(),
            }),
        }
    }

    /// Create a queue using the configured unique-queue delay.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.unique_delay())
    }

    /// Enqueue `task` as the next run for `key`, replacing any pending task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push<T, Fut>(&self, key: K, task: Fut) -> Completion<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let _ = tx.send(task.await);
        }
        .boxed();

        let start_worker = match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get_mut().pending.get_mut().replace(job).is_some() {
                    debug!("pending task superseded");
                }
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    pending: Mutex::new(Some(job)),
                });
                true
            }
        };

        if start_worker {
            tokio::spawn(work(Arc::clone(&self.inner), key));
        }

        Completion::new(rx, || Error::Superseded)
    }

    /// Whether `key` has a task waiting to start.
    pub fn is_pending(&self, key: &K) -> bool {
        self.inner
            .slots
            .get(key)
            .is_some_and(|slot| slot.pending.lock().is_some())
    }

    /// Number of keys with a live worker.
    pub fn active_keys(&self) -> usize {
        self.inner.slots.len()
    }
}

impl<K: Eq + Hash> Clone for UniqueQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash> std::fmt::Debug for UniqueQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniqueQueue")
            .field("delay", &self.inner.delay)
            .field("active_keys", &self.inner.slots.len())
            .finish()
    }
}

/// Removes the key's entry if its worker is dropped mid-run, so the next push
/// starts a new worker.
struct WorkerGuard<K: Eq + Hash> {
    inner: Arc<Inner<K>>,
    key: Option<K>,
}

impl<K: Eq + Hash> Drop for WorkerGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inner.slots.remove(&key);
        }
    }
}

async fn work<K>(inner: Arc<Inner<K>>, key: K)
where
    K: Eq + Hash + Clone,
{
    let mut guard = WorkerGuard {
        inner: Arc::clone(&inner),
        key: Some(key.clone()),
    };

    loop {
        tokio::time::sleep(inner.delay).await;

        let job = match inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut().pending.get_mut().take() {
                Some(job) => job,
                None => {
                    occupied.remove();
                    guard.key = None;
                    return;
                }
            },
            Entry::Vacant(_) => {
                guard.key = None;
                return;
            }
        };

        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!("unique queue task panicked, key stays live");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn pending_task_is_replaced() {
        let queue = UniqueQueue::new(Duration::from_millis(10));
        let ran = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let ran = ran.clone();
            queue.push("k", async move { ran.lock().push("t1") })
        };
        let second = {
            let ran = ran.clone();
            queue.push("k", async move { ran.lock().push("t2") })
        };

        assert!(matches!(first.await, Err(Error::Superseded)));
        second.await.unwrap();
        assert_eq!(*ran.lock(), vec!["t2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_keeps_key_worker() {
        let queue = UniqueQueue::new(Duration::from_millis(1));

        let failed = queue.push("k", async {
            panic!("task blew up");
        });
        assert!(failed.await.is_err());

        let next = queue.push("k", async { 7 });
        assert_eq!(next.await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn running_task_is_not_interrupted() {
        let queue = UniqueQueue::new(Duration::from_millis(1));
        let runs = Arc::new(AtomicUsize::new(0));

        let first = {
            let runs = runs.clone();
            queue.push(1u32, async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                runs.fetch_add(1, Ordering::SeqCst);
                "first"
            })
        };

        // Let the first task start.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!queue.is_pending(&1));

        let second = {
            let runs = runs.clone();
            queue.push(1u32, async move {
                runs.fetch_add(1, Ordering::SeqCst);
                "second"
            })
        };
        assert!(queue.is_pending(&1));

        assert_eq!(first.await.unwrap(), "first");
        assert_eq!(second.await.unwrap(), "second");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_run_independently() {
        let queue = UniqueQueue::new(Duration::from_millis(1));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocked = queue.push("a", async move {
            let _ = release_rx.await;
            "a"
        });
        let free = queue.push("b", async { "b" });

        assert_eq!(free.await.unwrap(), "b");
        assert_eq!(queue.active_keys(), 2);

        release_tx.send(()).unwrap();
        assert_eq!(blocked.await.unwrap(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn worker_retires_when_idle() {
        let queue = UniqueQueue::from_config(&QueueConfig::default());
        queue.push("k", async {}).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.active_keys(), 0);

        // A fresh push starts a new worker.
        assert_eq!(queue.push("k", async { 3 }).await.unwrap(), 3);
    }
}
