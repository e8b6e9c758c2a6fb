//! Capture Scope
//!
//! The capture scope collects the signals read while an auto-capture effect
//! runs. This enables automatic dependency tracking: when a signal is read,
//! it records itself in the scope of the task that read it.
//!
//! # Implementation
//!
//! The scope is created per effect invocation and handed to the effect's
//! context. It is also installed as a tokio task-local for the duration of
//! the body, so reads anywhere on that task, across any number of await
//! points, land in the right accumulator. Two effects capturing on different
//! tasks never see each other's reads.
//!
//! Work the body spawns onto other tasks is not captured.

use std::future::Future;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::graph::SignalId;

tokio::task_local! {
    static CAPTURE: CaptureScope;
}

/// Accumulator of signal reads for one effect invocation.
#[derive(Clone, Default)]
pub struct CaptureScope {
    reads: Arc<Mutex<SmallVec<[SignalId; 8]>>>,
}

impl CaptureScope {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `future` with this scope installed on the current task.
    pub async fn enter<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CAPTURE.scope(self, future).await
    }

    /// Run `f` synchronously with this scope installed.
    pub fn enter_sync<R>(self, f: impl FnOnce() -> R) -> R {
        CAPTURE.sync_scope(self, f)
    }

    /// Check if a scope is installed on the current task.
    pub fn is_active() -> bool {
        CAPTURE.try_with(|_| ()).is_ok()
    }

    /// Record a read in the current task's scope, if any.
    ///
    /// Returns `true` if a scope was active. Called by signals when they are
    /// read.
    pub fn track(signal: SignalId) -> bool {
        CAPTURE.try_with(|scope| scope.record(signal)).is_ok()
    }

    /// Record a read in this scope.
    pub fn record(&self, signal: SignalId) {
        self.reads.lock().push(signal);
    }

    /// Number of reads recorded so far, duplicates included.
    pub fn len(&self) -> usize {
        self.reads.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.reads.lock().is_empty()
    }

    /// Take the recorded reads, deduplicated in first-read order.
    pub fn drain(&self) -> IndexSet<SignalId> {
        self.reads.lock().drain(..).collect()
    }
}

impl std::fmt::Debug for CaptureScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureScope")
            .field("reads", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_outside_scope() {
        assert!(!CaptureScope::is_active());
        assert!(!CaptureScope::track(SignalId::new()));
    }

    #[test]
    fn sync_scope_records_reads() {
        let scope = CaptureScope::new();
        let (a, b) = (SignalId::new(), SignalId::new());

        scope.clone().enter_sync(|| {
            assert!(CaptureScope::is_active());
            CaptureScope::track(a);
            CaptureScope::track(b);
            CaptureScope::track(a);
        });

        assert_eq!(scope.len(), 3);
        let reads: Vec<SignalId> = scope.drain().into_iter().collect();
        assert_eq!(reads, vec![a, b]);
        assert!(scope.is_empty());
    }

    #[tokio::test]
    async fn scope_survives_await_points() {
        let scope = CaptureScope::new();
        let (a, b) = (SignalId::new(), SignalId::new());

        scope
            .clone()
            .enter(async move {
                CaptureScope::track(a);
                tokio::task::yield_now().await;
                CaptureScope::track(b);
            })
            .await;

        assert_eq!(scope.drain().len(), 2);
        assert!(!CaptureScope::is_active());
    }

    #[tokio::test]
    async fn nested_scopes_are_isolated() {
        let outer = CaptureScope::new();
        let inner = CaptureScope::new();
        let (a, b) = (SignalId::new(), SignalId::new());

        let inner_clone = inner.clone();
        outer
            .clone()
            .enter(async move {
                CaptureScope::track(a);
                inner_clone
                    .enter(async move {
                        CaptureScope::track(b);
                    })
                    .await;
            })
            .await;

        assert_eq!(outer.drain().into_iter().collect::<Vec<_>>(), vec![a]);
        assert_eq!(inner.drain().into_iter().collect::<Vec<_>>(), vec![b]);
    }

    #[tokio::test]
    async fn concurrent_tasks_do_not_interleave() {
        let first = CaptureScope::new();
        let second = CaptureScope::new();
        let (a, b) = (SignalId::new(), SignalId::new());

        let left = first.clone().enter(async move {
            CaptureScope::track(a);
            tokio::task::yield_now().await;
            CaptureScope::track(a);
        });
        let right = second.clone().enter(async move {
            CaptureScope::track(b);
            tokio::task::yield_now().await;
        });
        tokio::join!(left, right);

        assert_eq!(first.drain().into_iter().collect::<Vec<_>>(), vec![a]);
        assert_eq!(second.drain().into_iter().collect::<Vec<_>>(), vec![b]);
    }
}
