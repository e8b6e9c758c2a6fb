//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! notifies the effects that depend on it when that value changes.
//!
//! # How Signals Work
//!
//! 1. When a signal is read inside an auto-capture effect, the read is
//!    recorded in that effect's capture scope.
//!
//! 2. When a signal is written with a value different from the current one,
//!    the previous value is kept and every subscribed effect is queued to
//!    re-run. Writing an equal value does nothing.
//!
//! 3. Values mutated in place can force a notification with
//!    [`Signal::notify`] or [`Signal::mutate`].
//!
//! # Thread Safety
//!
//! The value sits behind a `parking_lot::RwLock`; subscribers live in the
//! runtime's graph, not in the signal. Reads and writes are synchronous and
//! never suspend.
//!
//! # Lifetime
//!
//! [`Signal::unref`] detaches every subscriber, clears the value and
//! unregisters the signal. Any later read panics (or errors, for the `try_`
//! variants) and writes are ignored. Dropping the last handle also
//! unregisters the signal.

use std::any::type_name;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{trace, warn};

use super::context::CaptureScope;
use super::effect::Effect;
use super::runtime::Runtime;
use crate::error::{Error, Result};
use crate::graph::SignalId;

/// Something an effect can subscribe to.
///
/// Implemented by [`Signal`] and [`Derived`](super::Derived).
pub trait Observable: Clone + Send + Sync + 'static {
    /// Identity of the underlying signal.
    fn signal_id(&self) -> SignalId;

    /// Runtime the signal is registered with.
    fn runtime(&self) -> &Runtime;
}

struct Slot<T> {
    current: Option<T>,
    prev: Option<T>,
}

struct SignalInner<T> {
    id: SignalId,
    runtime: Runtime,
    slot: RwLock<Slot<T>>,
    released: AtomicBool,
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            self.runtime.release_signal(self.id);
        }
    }
}

/// A reactive cell holding a value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// assert!(count.set(5));   // changed, subscribers notified
/// assert!(!count.set(5));  // unchanged, nothing happens
/// assert_eq!(count.prev(), Some(0));
/// ```
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a signal on the global runtime.
    pub fn new(value: T) -> Self {
        Self::new_in(&Runtime::global(), value)
    }

    /// Create a signal on `runtime`.
    pub fn new_in(runtime: &Runtime, value: T) -> Self {
        Self::build(runtime, Some(value))
    }

    /// A signal with no value yet.
    pub(crate) fn empty_in(runtime: &Runtime) -> Self {
        Self::build(runtime, None)
    }

    /// A handle that does not keep the signal alive.
    pub(crate) fn downgrade(&self) -> WeakSignal<T> {
        WeakSignal {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn build(runtime: &Runtime, value: Option<T>) -> Self {
        let id = SignalId::new();
        runtime.register_signal(id, type_name::<T>());
        Self {
            inner: Arc::new(SignalInner {
                id,
                runtime: runtime.clone(),
                slot: RwLock::new(Slot {
                    current: value,
                    prev: None,
                }),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> SignalId {
        self.inner.id
    }

    /// The runtime this signal is registered with.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Get the current value, recording the read for auto-capture.
    ///
    /// # Panics
    ///
    /// Panics if the signal has been released or has no value yet.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(e) => panic!("{e}"),
        }
    }

    /// Get the current value, recording the read for auto-capture.
    pub fn try_get(&self) -> Result<T> {
        CaptureScope::track(self.inner.id);
        self.try_get_untracked()
    }

    /// Get the current value without recording the read.
    ///
    /// # Panics
    ///
    /// Panics if the signal has been released or has no value yet.
    pub fn get_untracked(&self) -> T {
        match self.try_get_untracked() {
            Ok(value) => value,
            Err(e) => panic!("{e}"),
        }
    }

    /// Get the current value without recording the read.
    pub fn try_get_untracked(&self) -> Result<T> {
        if self.is_released() {
            return Err(Error::Released(self.inner.id));
        }
        self.inner
            .slot
            .read()
            .current
            .clone()
            .ok_or(Error::Uninitialized(self.inner.id))
    }

    /// Borrow the current value without cloning it, recording the read.
    ///
    /// `f` runs under the value's read lock and must not write to this
    /// signal.
    ///
    /// # Panics
    ///
    /// Panics if the signal has been released or has no value yet.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        CaptureScope::track(self.inner.id);
        if self.is_released() {
            panic!("{}", Error::Released(self.inner.id));
        }
        let slot = self.inner.slot.read();
        match slot.current.as_ref() {
            Some(value) => f(value),
            None => panic!("{}", Error::Uninitialized(self.inner.id)),
        }
    }

    /// The last value this signal held before the current one.
    pub fn prev(&self) -> Option<T> {
        self.inner.slot.read().prev.clone()
    }

    /// Set a new value and notify subscribers.
    ///
    /// Returns `false` without notifying if `value` equals the current value
    /// or the signal has been released.
    pub fn set(&self, value: T) -> bool {
        self.write(value)
    }

    pub(crate) fn write(&self, value: T) -> bool {
        if self.is_released() {
            warn!(signal = %self.inner.id, "write to released signal ignored");
            return false;
        }

        {
            let mut slot = self.inner.slot.write();
            if slot.current.as_ref() == Some(&value) {
                return false;
            }
            slot.prev = slot.current.replace(value);
        }

        trace!(signal = %self.inner.id, "value changed");
        self.inner.runtime.notify(self.inner.id);
        true
    }

    /// Update the value using a function of the current one.
    ///
    /// This is useful for updates that depend on the current value.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            let slot = self.inner.slot.read();
            match slot.current.as_ref() {
                Some(current) => f(current),
                None => return false,
            }
        };
        self.set(next)
    }

    /// Notify subscribers without changing the value.
    pub fn notify(&self) {
        if self.is_released() {
            warn!(signal = %self.inner.id, "notify on released signal ignored");
            return;
        }
        self.inner.runtime.notify(self.inner.id);
    }

    /// Mutate the value in place, then notify subscribers unconditionally.
    ///
    /// The previous value is left as is.
    pub fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        {
            let mut slot = self.inner.slot.write();
            if let Some(current) = slot.current.as_mut() {
                f(current);
            }
        }
        self.notify();
    }

    /// Await `mutation`, then notify subscribers.
    ///
    /// For values changed through some other handle (shared buffers, interior
    /// mutability) by asynchronous work.
    pub async fn notify_after<Fut>(&self, mutation: Fut) -> Fut::Output
    where
        Fut: Future,
    {
        let output = mutation.await;
        self.notify();
        output
    }

    /// Stop notifying `effect`. Returns `true` if it was subscribed.
    pub fn remove_subscriber(&self, effect: &Effect) -> bool {
        self.inner.runtime.unsubscribe(effect.id(), self.inner.id)
    }

    /// Stop notifying every subscriber. Returns how many there were.
    pub fn remove_all_subscribers(&self) -> usize {
        self.inner.runtime.unsubscribe_all(self.inner.id)
    }

    /// Release the signal: detach all subscribers, clear the value and
    /// unregister it. The signal must not be used afterwards.
    pub fn unref(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut slot = self.inner.slot.write();
            slot.current = None;
            slot.prev = None;
        }
        self.inner.runtime.release_signal(self.inner.id);
    }

    /// Check if the signal has been released.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Get the number of subscribed effects.
    pub fn subscriber_count(&self) -> usize {
        self.inner.runtime.subscriber_count(self.inner.id)
    }
}

impl<T> Observable for Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn signal_id(&self) -> SignalId {
        self.inner.id
    }

    fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning signal handle, held by a derived value's computation.
pub(crate) struct WeakSignal<T> {
    inner: Weak<SignalInner<T>>,
}

impl<T> WeakSignal<T> {
    pub(crate) fn upgrade(&self) -> Option<Signal<T>> {
        self.inner.upgrade().map(|inner| Signal { inner })
    }
}

impl<T> Debug for Signal<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.inner.slot.read();
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &slot.current)
            .field("released", &self.inner.released.load(Ordering::SeqCst))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn signal_get_and_set() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, 0);
        assert_eq!(signal.get(), 0);

        assert!(signal.set(42));
        assert_eq!(signal.get(), 42);
        assert_eq!(signal.prev(), Some(0));
    }

    #[test]
    fn equal_write_is_ignored() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, "a".to_string());

        assert!(!signal.set("a".to_string()));
        assert_eq!(signal.prev(), None);

        assert!(signal.set("b".to_string()));
        assert!(!signal.set("b".to_string()));
        assert_eq!(signal.prev().as_deref(), Some("a"));
    }

    #[test]
    fn signal_update() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, 10);
        assert!(signal.update(|v| v + 5));
        assert!(!signal.update(|v| *v));
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_with_borrows() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, vec![1, 2, 3]);
        assert_eq!(signal.with(|v| v.len()), 3);
    }

    #[test]
    fn signal_clone_shares_state() {
        let rt = Runtime::default();
        let signal1 = Signal::new_in(&rt, 0);
        let signal2 = signal1.clone();

        signal1.set(42);
        assert_eq!(signal2.get(), 42);
        assert_eq!(signal1.id(), signal2.id());
    }

    #[test]
    fn signal_ids_are_unique() {
        let s1 = Signal::new(0);
        let s2 = Signal::new(0);
        assert_ne!(s1.id(), s2.id());
    }

    #[test]
    fn reads_are_captured_in_scope() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, 1);
        let scope = CaptureScope::new();

        scope.clone().enter_sync(|| {
            signal.get();
            signal.get_untracked();
        });

        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn unref_releases_signal() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, 7);
        signal.unref();
        signal.unref();

        assert!(signal.is_released());
        assert!(matches!(signal.try_get(), Err(Error::Released(_))));
        assert!(!signal.set(8));
        assert_eq!(rt.signal_count(), 0);
    }

    #[test]
    #[should_panic(expected = "has been released")]
    fn read_after_unref_panics() {
        let signal = Signal::new_in(&Runtime::default(), 7);
        signal.unref();
        signal.get();
    }

    #[test]
    fn empty_signal_reports_uninitialized() {
        let rt = Runtime::default();
        let signal: Signal<u8> = Signal::empty_in(&rt);
        assert!(matches!(signal.try_get(), Err(Error::Uninitialized(_))));
        assert!(!signal.update(|v| v + 1));
    }

    #[tokio::test]
    async fn mutate_notifies_even_without_change() {
        let rt = Runtime::default();
        let list = Signal::new_in(&rt, vec![1]);
        let runs = Arc::new(AtomicI32::new(0));

        let _effect = {
            let (list, runs) = (list.clone(), runs.clone());
            Effect::new_in(&rt, move |cx| {
                cx.subscribe(&list);
                runs.fetch_add(1, Ordering::SeqCst);
                async {}
            })
            .await
        };

        list.mutate(|v| v.push(2));
        rt.settle().await;
        assert_eq!(list.get(), vec![1, 2]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        list.notify_after(async {}).await;
        rt.settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn remove_subscribers() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, 0);

        let make = |signal: Signal<i32>| {
            Effect::new_in(&rt, move |cx| {
                cx.subscribe(&signal);
                async {}
            })
        };
        let first = make(signal.clone()).await;
        let _second = make(signal.clone()).await;
        assert_eq!(signal.subscriber_count(), 2);

        assert!(signal.remove_subscriber(&first));
        assert!(!signal.remove_subscriber(&first));
        assert_eq!(signal.subscriber_count(), 1);
        assert!(rt.dependencies_of(first.id()).is_empty());
        assert!(rt.is_consistent());

        assert_eq!(signal.remove_all_subscribers(), 1);
        signal.set(1);
        rt.settle().await;
        assert_eq!(first.run_count(), 1);
        assert!(rt.is_consistent());
    }
}
