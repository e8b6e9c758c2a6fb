//! Derived Implementation
//!
//! A Derived is a signal whose value is computed from other signals by an
//! internal effect. It can be read and subscribed to like any signal, but
//! only its own computation may write it.
//!
//! # How Derived Values Work
//!
//! 1. Construction creates an empty backing signal and an effect that runs
//!    the computation and writes the result into it.
//!
//! 2. When an input changes, the effect re-runs and writes the new result.
//!    The write is equality-gated like any other, so a recomputation that
//!    produces the same value does not notify downstream effects.
//!
//! 3. Outside writes through [`Derived::set`] are rejected with a warning and
//!    leave the value untouched.
//!
//! # Differences from Signal
//!
//! - Value changes are eager and asynchronous: they land when the internal
//!   effect's run completes, not when an input is written.
//! - The computation holds the backing signal weakly. Once every handle is
//!   dropped, the next recomputation retires the effect instead of running.
//!   [`Derived::remove`] retires it immediately.

use std::fmt::Debug;
use std::future::Future;

use tracing::{debug, warn};

use super::effect::{CaptureMode, Effect, EffectContext};
use super::runtime::Runtime;
use super::signal::{Observable, Signal};
use crate::error::Result;
use crate::graph::SignalId;

/// A read-only signal computed from other signals.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(2);
///
/// let doubled = Derived::new({
///     let count = count.clone();
///     move |cx| {
///         let count = cx.subscribe(&count);
///         async move { count.get() * 2 }
///     }
/// })
/// .await;
///
/// assert_eq!(doubled.get(), 4);
/// assert!(!doubled.set(10)); // rejected
/// ```
pub struct Derived<T> {
    signal: Signal<T>,
    effect: Effect,
}

impl<T> Derived<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a derived value on the global runtime whose computation
    /// subscribes explicitly. Waits for the first computation.
    pub async fn new<F, Fut>(compute: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::new_in(&Runtime::global(), compute).await
    }

    /// Create an explicitly subscribing derived value on `runtime`.
    pub async fn new_in<F, Fut>(runtime: &Runtime, compute: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::build(runtime, CaptureMode::Explicit, compute).await
    }

    /// Create a derived value on the global runtime whose dependencies are
    /// the signals its computation reads.
    pub async fn auto<F, Fut>(compute: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::auto_in(&Runtime::global(), compute).await
    }

    /// Create an auto-capturing derived value on `runtime`.
    pub async fn auto_in<F, Fut>(runtime: &Runtime, compute: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::build(runtime, CaptureMode::Auto, compute).await
    }

    async fn build<F, Fut>(runtime: &Runtime, mode: CaptureMode, compute: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let signal = Signal::empty_in(runtime);
        let target = signal.downgrade();
        let effect = Effect::create(runtime, mode, move |cx: EffectContext| {
            let job = match target.upgrade() {
                Some(target) => Some((target, compute(cx))),
                None => {
                    debug!(effect = %cx.effect_id(), "derived value dropped, retiring its effect");
                    cx.remove_effect();
                    None
                }
            };
            async move {
                if let Some((target, pending)) = job {
                    target.write(pending.await);
                }
            }
        })
        .await;

        Self { signal, effect }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> SignalId {
        self.signal.id()
    }

    /// Get the current value, recording the read for auto-capture.
    ///
    /// # Panics
    ///
    /// Panics if the value was removed or never computed.
    pub fn get(&self) -> T {
        self.signal.get()
    }

    /// Get the current value, recording the read for auto-capture.
    pub fn try_get(&self) -> Result<T> {
        self.signal.try_get()
    }

    /// Get the current value without recording the read.
    pub fn get_untracked(&self) -> T {
        self.signal.get_untracked()
    }

    /// Borrow the current value, recording the read for auto-capture.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.signal.with(f)
    }

    /// The value before the latest recomputation that changed it.
    pub fn prev(&self) -> Option<T> {
        self.signal.prev()
    }

    /// Rejected: derived values are written only by their computation.
    ///
    /// Logs a warning and returns `false`.
    pub fn set(&self, _value: T) -> bool {
        warn!(signal = %self.signal.id(), "derived value cannot be set directly, write ignored");
        false
    }

    /// The effect that computes this value.
    pub fn effect(&self) -> &Effect {
        &self.effect
    }

    /// Get the number of effects subscribed to this value.
    pub fn subscriber_count(&self) -> usize {
        self.signal.subscriber_count()
    }

    /// Check if the value has been removed.
    pub fn is_released(&self) -> bool {
        self.signal.is_released()
    }

    /// Stop recomputing and release the backing signal.
    pub fn remove(&self) {
        self.effect.remove();
        self.signal.unref();
    }
}

impl<T> Observable for Derived<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn signal_id(&self) -> SignalId {
        self.signal.id()
    }

    fn runtime(&self) -> &Runtime {
        self.signal.runtime()
    }
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            effect: self.effect.clone(),
        }
    }
}

impl<T> Debug for Derived<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("signal", &self.signal)
            .field("effect", &self.effect)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
