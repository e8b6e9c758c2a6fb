//! FIFO Task Queue
//!
//! One ordered list of `(task, post-delay)` pairs drained by a single worker.
//! Task N+1 never starts before task N has completed and its delay has
//! elapsed, however long task N takes.
//!
//! The worker is spawned on the current tokio runtime when the queue goes
//! from empty to non-empty, and exits once the list is drained.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::completion::Completion;
use crate::config::QueueConfig;
use crate::error::Error;
use crate::lazy::Lazy;

static GLOBAL_QUEUE: Lazy<FifoQueue> = Lazy::new(FifoQueue::new);

struct Job {
    task: BoxFuture<'static, ()>,
    delay: Duration,
}

#[derive(Default)]
struct State {
    jobs: VecDeque<Job>,
    draining: bool,
}

struct Inner {
    default_delay: Duration,
    state: Mutex<State>,
}

/// Strictly ordered task queue.
///
/// # Example
///
/// ```rust,ignore
/// let queue = FifoQueue::new();
///
/// let first = queue.push(async { write_header().await });
/// let second = queue.push(async { write_body().await });
///
/// // `write_body` starts only after `write_header` finished.
/// second.await?;
/// ```
#[derive(Clone)]
pub struct FifoQueue {
    inner: Arc<Inner>,
}

impl FifoQueue {
    /// Create a queue with no delay between tasks.
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Create a queue using the configured FIFO delay.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::with_delay(config.fifo_delay())
    }

    /// Create a queue whose tasks are followed by `delay` unless pushed with
    /// an explicit one.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_delay: delay,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// The process-wide queue.
    pub fn global() -> &'static FifoQueue {
        &GLOBAL_QUEUE
    }

    /// Enqueue a task followed by the queue's default delay.
    pub fn push<T, Fut>(&self, task: Fut) -> Completion<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.push_with_delay(task, self.inner.default_delay)
    }

    /// Enqueue a task followed by `delay`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push_with_delay<T, Fut>(&self, task: Fut, delay: Duration) -> Completion<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Job {
            task: async move {
                let _ = tx.send(task.await);
            }
            .boxed(),
            delay,
        };

        let start_worker = {
            let mut state = self.inner.state.lock();
            state.jobs.push_back(job);
            debug!(queued = state.jobs.len(), "fifo task queued");
            !std::mem::replace(&mut state.draining, true)
        };

        if start_worker {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }

        Completion::new(rx, || Error::Abandoned)
    }

    /// Number of tasks waiting to start.
    pub fn len(&self) -> usize {
        self.inner.state.lock().jobs.len()
    }

    /// Whether no task is waiting to start.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the worker is idle (nothing running or waiting).
    pub fn is_idle(&self) -> bool {
        !self.inner.state.lock().draining
    }
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FifoQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FifoQueue")
            .field("queued", &state.jobs.len())
            .field("draining", &state.draining)
            .finish()
    }
}

/// Clears the draining flag if the worker is dropped mid-run (for example
/// when its runtime shuts down), so the next push starts a new worker.
struct DrainGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().draining = false;
        }
    }
}

async fn drain(inner: Arc<Inner>) {
    let mut guard = DrainGuard {
        inner: Arc::clone(&inner),
        armed: true,
    };

    loop {
        let job = {
            let mut state = inner.state.lock();
            match state.jobs.pop_front() {
                Some(job) => job,
                None => {
                    state.draining = false;
                    guard.armed = false;
                    return;
                }
            }
        };

        // A panicking task drops its sender, so its caller sees `Abandoned`.
        if AssertUnwindSafe(job.task).catch_unwind().await.is_err() {
            error!("fifo task panicked, continuing with the next task");
        }
        if !job.delay.is_zero() {
            tokio::time::sleep(job.delay).await;
        }
    }
}
