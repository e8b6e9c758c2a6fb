//! Effect Implementation
//!
//! An Effect is an asynchronous computation that re-runs whenever a signal
//! it depends on changes.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its body once and the constructor waits
//!    for that run, so dependencies are in place when it returns.
//!
//! 2. When any dependency changes, a new run is queued on the effect's own
//!    lane. Runs of one effect never overlap.
//!
//! 3. Each run computes a fresh dependency set. A successful run commits it
//!    into the graph; a failed or panicking run is logged and leaves the
//!    previous set untouched.
//!
//! # Capture Strategies
//!
//! - **Explicit** ([`Effect::new`]): the body calls
//!   [`EffectContext::subscribe`] for each signal it wants to follow. Each
//!   call links the signal immediately; signals not subscribed again during
//!   a run are pruned when the run finishes.
//!
//! - **Auto** ([`Effect::auto`]): every signal read during the body (via
//!   [`Signal::get`](super::Signal::get)) is recorded, across await points,
//!   and becomes exactly the new dependency set. First runs of auto effects
//!   are serialized runtime-wide unless disabled in
//!   [`CaptureConfig`](crate::config::CaptureConfig).
//!
//! # Cancellation
//!
//! There is none. A long body checks [`EffectContext::is_last_called`] and
//! returns early if a newer run has been queued in the meantime.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::context::CaptureScope;
use super::runtime::Runtime;
use super::signal::Observable;
use crate::error::Error;
use crate::graph::{EffectId, SignalId};

type Body = Box<dyn Fn(EffectContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// How an effect discovers its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Dependencies are the signals passed to [`EffectContext::subscribe`].
    Explicit,
    /// Dependencies are the signals read while the body runs.
    Auto,
}

/// Where an effect is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectState {
    /// Not running and linked to no signal.
    Unlinked,
    /// A run is in progress.
    Capturing,
    /// Not running and linked to at least one signal.
    Linked,
    /// Removed for good.
    Removed,
}

/// Values an effect body may resolve to.
///
/// `()` always succeeds. `Result<(), E>` fails with the rendered error.
pub trait EffectOutcome {
    /// Convert to a result, rendering any error.
    fn into_result(self) -> Result<(), String>;
}

impl EffectOutcome for () {
    fn into_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> EffectOutcome for Result<(), E> {
    fn into_result(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// Shared state of an effect, owned by the runtime's effect table.
pub(crate) struct EffectInner {
    id: EffectId,
    mode: CaptureMode,
    body: Body,
    generation: AtomicU64,
    removed: AtomicBool,
    running: AtomicBool,
    runs: AtomicUsize,
}

impl EffectInner {
    pub(crate) fn id(&self) -> EffectId {
        self.id
    }

    pub(crate) fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start a new generation and return its token.
    pub(crate) fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Run the body once and commit or roll back its dependencies.
    pub(crate) async fn execute(self: &Arc<Self>, runtime: Runtime, token: u64) {
        if self.is_removed() {
            return;
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let run = Arc::new(Mutex::new(RunState::default()));
        let cx = EffectContext {
            runtime: runtime.clone(),
            effect: Arc::clone(self),
            token,
            run: Arc::clone(&run),
        };

        // The body is called inside the future so its synchronous part is
        // also captured and caught. Explicit runs get a scope too, so their
        // reads never land in an enclosing effect's scope.
        let scope = CaptureScope::new();
        let body = async { (self.body)(cx).await };
        let outcome = AssertUnwindSafe(scope.clone().enter(body))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(Error::EffectFailed {
                effect: self.id,
                message,
            }),
            Err(panic) => Err(Error::EffectPanicked {
                effect: self.id,
                message: panic_message(panic.as_ref()),
            }),
        };

        let RunState {
            seen,
            added,
            removed,
        } = std::mem::take(&mut *run.lock());

        match result {
            Ok(()) => {
                let mut captured = scope.drain();
                captured.retain(|signal| !removed.contains(signal));
                runtime.commit(self.id, self.mode, seen, captured);
            }
            Err(error) => {
                for signal in added {
                    runtime.unsubscribe(self.id, signal);
                }
                error!(effect = %self.id, %error, "effect run failed, dependencies unchanged");
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }
}

/// Per-run bookkeeping shared with the context.
#[derive(Default)]
struct RunState {
    /// Signals subscribed during this run.
    seen: IndexSet<SignalId>,
    /// Edges this run created, undone if the run fails.
    added: Vec<SignalId>,
    /// Signals detached during this run.
    removed: IndexSet<SignalId>,
}

/// A computation that re-runs when its dependencies change.
///
/// Handles are cheap to clone; all clones refer to the same effect. Dropping
/// every handle does not stop the effect. Call [`Effect::remove`] for that.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// let effect = Effect::new({
///     let count = count.clone();
///     move |cx| {
///         let count = cx.subscribe(&count);
///         async move { println!("count is {}", count.get()) }
///     }
/// })
/// .await; // prints "count is 0"
///
/// count.set(5); // prints "count is 5" once the run is scheduled
/// ```
#[derive(Clone)]
pub struct Effect {
    runtime: Runtime,
    inner: Arc<EffectInner>,
}

impl Effect {
    /// Create an explicit-subscription effect on the global runtime and wait
    /// for its first run.
    pub async fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: EffectOutcome,
    {
        Self::new_in(&Runtime::global(), body).await
    }

    /// Create an explicit-subscription effect on `runtime`.
    pub async fn new_in<F, Fut>(runtime: &Runtime, body: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: EffectOutcome,
    {
        Self::create(runtime, CaptureMode::Explicit, body).await
    }

    /// Create an auto-capture effect on the global runtime and wait for its
    /// first run.
    pub async fn auto<F, Fut>(body: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: EffectOutcome,
    {
        Self::auto_in(&Runtime::global(), body).await
    }

    /// Create an auto-capture effect on `runtime`.
    pub async fn auto_in<F, Fut>(runtime: &Runtime, body: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: EffectOutcome,
    {
        Self::create(runtime, CaptureMode::Auto, body).await
    }

    pub(crate) async fn create<F, Fut>(runtime: &Runtime, mode: CaptureMode, body: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: EffectOutcome,
    {
        let body: Body = Box::new(move |cx: EffectContext| {
            body(cx).map(|outcome| outcome.into_result()).boxed()
        });
        let inner = Arc::new(EffectInner {
            id: EffectId::new(),
            mode,
            body,
            generation: AtomicU64::new(0),
            removed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        });

        runtime.insert_effect(Arc::clone(&inner));
        debug!(effect = %inner.id, ?mode, "effect created");
        runtime.run_first(Arc::clone(&inner)).await;

        Self {
            runtime: runtime.clone(),
            inner,
        }
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> EffectId {
        self.inner.id
    }

    /// How this effect discovers dependencies.
    pub fn mode(&self) -> CaptureMode {
        self.inner.mode
    }

    /// Number of times the body has been started.
    pub fn run_count(&self) -> usize {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Token of the most recently scheduled run.
    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    /// Number of signals the effect is linked to.
    pub fn dependency_count(&self) -> usize {
        self.runtime.dependency_count(self.inner.id)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EffectState {
        if self.inner.is_removed() {
            EffectState::Removed
        } else if self.inner.running.load(Ordering::SeqCst) {
            EffectState::Capturing
        } else if self.dependency_count() > 0 {
            EffectState::Linked
        } else {
            EffectState::Unlinked
        }
    }

    /// Check if the effect has been removed.
    pub fn is_removed(&self) -> bool {
        self.inner.is_removed()
    }

    /// Detach from every signal and never run again.
    ///
    /// A run already in progress finishes but commits nothing. Returns
    /// `false` if the effect was already removed.
    pub fn remove(&self) -> bool {
        self.runtime.remove_effect(self.inner.id)
    }

    /// Queue a run as if a dependency had changed.
    pub fn trigger(&self) {
        self.runtime.schedule(Arc::clone(&self.inner));
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("run_count", &self.run_count())
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Capabilities handed to an effect body for one run.
///
/// The context belongs to the run that received it: [`generation`] and
/// [`is_last_called`] describe that run, not the effect's latest one.
///
/// [`generation`]: EffectContext::generation
/// [`is_last_called`]: EffectContext::is_last_called
#[derive(Clone)]
pub struct EffectContext {
    runtime: Runtime,
    effect: Arc<EffectInner>,
    token: u64,
    run: Arc<Mutex<RunState>>,
}

impl EffectContext {
    /// Depend on `source` and return a handle to it.
    ///
    /// The edge is linked right away, so a change that happens later in this
    /// same run already queues a rerun.
    pub fn subscribe<S: Observable>(&self, source: &S) -> S {
        let signal = source.signal_id();
        if !source.runtime().ptr_eq(&self.runtime) {
            warn!(effect = %self.effect.id, %signal, "signal belongs to another runtime, not subscribed");
            return source.clone();
        }

        let linked = self.runtime.link(self.effect.id, signal);
        let mut run = self.run.lock();
        run.seen.insert(signal);
        run.removed.shift_remove(&signal);
        if linked {
            run.added.push(signal);
        }
        source.clone()
    }

    /// Detach from `source`. Retires the effect if no dependency remains.
    pub fn remove_signal<S: Observable>(&self, source: &S) {
        let signal = source.signal_id();
        {
            let mut run = self.run.lock();
            run.seen.shift_remove(&signal);
            run.added.retain(|added| *added != signal);
            run.removed.insert(signal);
        }
        self.runtime.detach(self.effect.id, signal);
    }

    /// Detach from every signal and never run again.
    pub fn remove_effect(&self) -> bool {
        self.runtime.remove_effect(self.effect.id)
    }

    /// Whether this run is still the newest one, optionally after waiting.
    ///
    /// Returns `false` once a newer run has been queued or the effect has
    /// been removed.
    pub async fn is_last_called(&self, wait: Option<Duration>) -> bool {
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        !self.effect.is_removed() && self.effect.generation() == self.token
    }

    /// Token of this run.
    pub fn generation(&self) -> u64 {
        self.token
    }

    /// The effect this run belongs to.
    pub fn effect_id(&self) -> EffectId {
        self.effect.id
    }

    /// The runtime the effect lives in.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

impl fmt::Debug for EffectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectContext")
            .field("effect", &self.effect.id)
            .field("generation", &self.token)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
