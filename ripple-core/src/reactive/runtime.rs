//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, derived
//! values, and effects. It owns the dependency graph and schedules effect
//! runs when signals change.
//!
//! # How It Works
//!
//! 1. Signals and effects register with the runtime when created. Effects
//!    live in an indexed table; signals are known by id only.
//!
//! 2. An effect run produces a dependency set, which the runtime commits into
//!    the graph in one step once the run succeeds.
//!
//! 3. When a signal's value changes, the runtime:
//!    a. Looks up the signal's subscribers
//!    b. Prunes any that are no longer in the effect table
//!    c. Bumps each effect's generation and queues a run on its key
//!
//! # Locking
//!
//! All graph state sits behind one mutex that is never held across an await
//! point or while running user code. Effect handles removed from the table
//! are dropped only after the lock is released, since dropping the last
//! handle can drop signals that call back into the runtime.
//!
//! # Scheduling
//!
//! Runs of one effect are serialized through a keyed [`Channel`], so an
//! effect never runs twice at once and runs start in notification order.
//! Runs of different effects proceed independently on the tokio runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, trace};

use super::context::CaptureScope;
use super::effect::{CaptureMode, EffectInner};
use crate::config::RuntimeConfig;
use crate::graph::{DependencyGraph, EffectId, SignalId};
use crate::lazy::Lazy;
use crate::queue::{Channel, FifoQueue, Permit, UniqueQueue};

static GLOBAL_RUNTIME: Lazy<Runtime> = Lazy::new(|| Runtime::new(RuntimeConfig::default()));

#[derive(Default)]
struct Registry {
    graph: DependencyGraph,
    effects: HashMap<EffectId, Arc<EffectInner>>,
    /// Live signals and their value type names.
    signals: IndexMap<SignalId, &'static str>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    registry: Mutex<Registry>,
    /// One lane per effect: runs of an effect never overlap.
    runs: Channel<EffectId>,
    /// The FIFO lane serializes auto-capture first runs.
    capture: Channel<EffectId>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Owner of the dependency graph and the effect scheduler.
///
/// Cloning a runtime is cheap; clones share the same graph. Most code uses
/// [`Runtime::global`], while tests usually create a private runtime so they
/// do not observe each other's signals.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create an independent runtime.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                registry: Mutex::new(Registry::default()),
                runs: Channel::new(),
                capture: Channel::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// The process-wide runtime used by `Signal::new`, `Effect::new` and
    /// friends.
    pub fn global() -> Runtime {
        GLOBAL_RUNTIME.clone()
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Check if two handles refer to the same runtime.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A FIFO queue using this runtime's configured delay.
    pub fn fifo_queue(&self) -> FifoQueue {
        FifoQueue::from_config(&self.inner.config.queue)
    }

    /// A unique queue using this runtime's configured delay.
    pub fn unique_queue<K>(&self) -> UniqueQueue<K>
    where
        K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    {
        UniqueQueue::from_config(&self.inner.config.queue)
    }

    /// Wait until no effect run is queued or running.
    ///
    /// Runs triggered while waiting are waited for as well.
    pub async fn settle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Number of effect runs queued or running.
    pub fn pending_runs(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Number of live signals.
    pub fn signal_count(&self) -> usize {
        self.inner.registry.lock().signals.len()
    }

    /// Number of live effects.
    pub fn effect_count(&self) -> usize {
        self.inner.registry.lock().effects.len()
    }

    /// Check the graph invariants: both edge maps mirror each other, and
    /// every edge joins a live effect to a live signal.
    pub fn is_consistent(&self) -> bool {
        let registry = self.inner.registry.lock();
        registry.graph.is_symmetric()
            && registry
                .graph
                .effects()
                .all(|effect| registry.effects.contains_key(&effect))
            && registry
                .graph
                .signals()
                .all(|signal| registry.signals.contains_key(&signal))
    }

    /// Signals `effect` currently depends on, in link order.
    pub fn dependencies_of(&self, effect: EffectId) -> Vec<SignalId> {
        self.inner
            .registry
            .lock()
            .graph
            .dependencies(effect)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Effects currently subscribed to `signal`, in subscription order.
    pub fn subscribers_of(&self, signal: SignalId) -> Vec<EffectId> {
        self.inner
            .registry
            .lock()
            .graph
            .subscribers(signal)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    // ---- Signal bookkeeping ----

    pub(crate) fn register_signal(&self, signal: SignalId, type_name: &'static str) {
        self.inner.registry.lock().signals.insert(signal, type_name);
        trace!(%signal, type_name, "signal registered");
    }

    /// Forget a signal and every edge touching it.
    pub(crate) fn release_signal(&self, signal: SignalId) {
        let detached = {
            let mut registry = self.inner.registry.lock();
            registry.signals.shift_remove(&signal);
            registry.graph.detach_signal(signal)
        };
        debug!(%signal, detached = detached.len(), "signal released");
    }

    pub(crate) fn subscriber_count(&self, signal: SignalId) -> usize {
        self.inner.registry.lock().graph.subscriber_count(signal)
    }

    pub(crate) fn unsubscribe(&self, effect: EffectId, signal: SignalId) -> bool {
        self.inner.registry.lock().graph.unlink(effect, signal)
    }

    pub(crate) fn unsubscribe_all(&self, signal: SignalId) -> usize {
        self.inner.registry.lock().graph.detach_signal(signal).len()
    }

    /// Queue a run of every effect subscribed to `signal`.
    ///
    /// Subscribers missing from the effect table are unlinked before anything
    /// is scheduled.
    pub(crate) fn notify(&self, signal: SignalId) {
        let targets: Vec<Arc<EffectInner>> = {
            let mut registry = self.inner.registry.lock();
            let Some(subscribers) = registry.graph.subscribers(signal) else {
                return;
            };

            let mut live = Vec::with_capacity(subscribers.len());
            let mut stale = Vec::new();
            for effect in subscribers {
                match registry.effects.get(effect) {
                    Some(inner) => live.push(Arc::clone(inner)),
                    None => stale.push(*effect),
                }
            }
            for effect in stale {
                debug!(%signal, %effect, "pruned removed subscriber");
                registry.graph.unlink(effect, signal);
            }
            live
        };

        trace!(%signal, subscribers = targets.len(), "notifying");
        for effect in targets {
            self.schedule(effect);
        }
    }

    // ---- Effect bookkeeping ----

    pub(crate) fn insert_effect(&self, effect: Arc<EffectInner>) {
        let id = effect.id();
        self.inner.registry.lock().effects.insert(id, effect);
        trace!(effect = %id, "effect registered");
    }

    /// Take an effect out of the table and detach it from every signal.
    ///
    /// Returns `false` if it was already removed.
    pub(crate) fn remove_effect(&self, effect: EffectId) -> bool {
        let (removed, detached) = {
            let mut registry = self.inner.registry.lock();
            let removed = registry.effects.remove(&effect);
            let detached = registry.graph.detach_effect(effect);
            (removed, detached)
        };

        match removed {
            Some(inner) => {
                inner.mark_removed();
                debug!(%effect, detached = detached.len(), "effect removed");
                drop(inner);
                true
            }
            None => false,
        }
    }

    /// Link `effect` to `signal` right away.
    ///
    /// Does nothing if the effect has been removed.
    pub(crate) fn link(&self, effect: EffectId, signal: SignalId) -> bool {
        let mut registry = self.inner.registry.lock();
        if !registry.effects.contains_key(&effect) || !registry.signals.contains_key(&signal) {
            return false;
        }
        registry.graph.link(effect, signal)
    }

    /// Unlink `effect` from `signal`, retiring the effect if that was its
    /// last dependency.
    pub(crate) fn detach(&self, effect: EffectId, signal: SignalId) {
        let retire = {
            let mut registry = self.inner.registry.lock();
            registry.graph.unlink(effect, signal);
            registry.graph.dependency_count(effect) == 0
        };
        if retire && self.remove_effect(effect) {
            debug!(%effect, "effect retired after losing its last signal");
        }
    }

    pub(crate) fn dependency_count(&self, effect: EffectId) -> usize {
        self.inner.registry.lock().graph.dependency_count(effect)
    }

    /// Commit the outcome of a successful run.
    ///
    /// `seen` holds the explicit subscriptions of the run and `captured` the
    /// reads recorded by the capture scope. Explicit effects keep only what
    /// they subscribed to this run; auto-capture effects get exactly the
    /// union of both.
    pub(crate) fn commit(
        &self,
        effect: EffectId,
        mode: CaptureMode,
        seen: IndexSet<SignalId>,
        captured: IndexSet<SignalId>,
    ) {
        let mut registry = self.inner.registry.lock();
        if !registry.effects.contains_key(&effect) {
            return;
        }

        match mode {
            CaptureMode::Explicit => {
                let pruned = registry.graph.retain(effect, &seen);
                if !pruned.is_empty() {
                    debug!(%effect, pruned = pruned.len(), "stale subscriptions pruned");
                }
            }
            CaptureMode::Auto => {
                let mut next = seen;
                next.extend(captured);
                next.retain(|signal| registry.signals.contains_key(signal));
                trace!(%effect, dependencies = next.len(), "captured dependencies committed");
                registry.graph.replace(effect, next);
            }
        }
    }

    // ---- Scheduling ----

    /// Run an effect for the first time and wait for the run to finish.
    pub(crate) async fn run_first(&self, effect: Arc<EffectInner>) {
        let token = effect.advance();
        let _in_flight = self.begin_run();

        // A first run nested in another run skips the lane, which an
        // enclosing run may hold.
        let serialize = effect.mode() == CaptureMode::Auto
            && self.inner.config.capture.serialize_first_runs
            && !CaptureScope::is_active();
        let gate = if serialize {
            acquire_or_log(self.inner.capture.fifo().await, effect.id())
        } else {
            None
        };

        let Some(permit) = acquire_or_log(self.inner.runs.key(effect.id()).await, effect.id())
        else {
            return;
        };
        effect.execute(self.clone(), token).await;
        permit.resume();
        if let Some(gate) = gate {
            gate.resume();
        }
    }

    /// Queue a run of `effect` on its own lane.
    ///
    /// Needs a tokio runtime; without one the run is dropped and logged.
    pub(crate) fn schedule(&self, effect: Arc<EffectInner>) {
        if effect.is_removed() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                error!(effect = %effect.id(), "no tokio runtime available; effect run dropped");
                return;
            }
        };

        let token = effect.advance();
        let acquire = self.inner.runs.key(effect.id());
        let in_flight = self.begin_run();
        let runtime = self.clone();

        handle.spawn(async move {
            let _in_flight = in_flight;
            let Some(permit) = acquire_or_log(acquire.await, effect.id()) else {
                return;
            };
            if effect.is_removed() {
                trace!(effect = %effect.id(), "skipping run of removed effect");
                return;
            }
            effect.execute(runtime, token).await;
            permit.resume();
        });
    }

    fn begin_run(&self) -> RunGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        RunGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("Runtime")
            .field("signals", &registry.signals.len())
            .field("effects", &registry.effects.len())
            .field("edges", &registry.graph.edge_count())
            .field("pending_runs", &self.inner.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

/// Counts one queued or running effect run.
struct RunGuard {
    inner: Arc<RuntimeInner>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

fn acquire_or_log(
    permit: crate::error::Result<Permit<EffectId>>,
    effect: EffectId,
) -> Option<Permit<EffectId>> {
    match permit {
        Ok(permit) => Some(permit),
        Err(e) => {
            error!(%effect, error = %e, "could not acquire effect lane");
            None
        }
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Effect, EffectContext, Signal};
    use std::sync::atomic::AtomicI32;

    #[test]
    fn global_runtime_is_shared() {
        assert!(Runtime::global().ptr_eq(&Runtime::global()));
        assert!(!Runtime::global().ptr_eq(&Runtime::default()));
    }

    #[test]
    fn signals_register_and_release() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, 1);
        assert_eq!(rt.signal_count(), 1);

        signal.unref();
        assert_eq!(rt.signal_count(), 0);
        assert!(rt.is_consistent());
    }

    #[test]
    fn dropping_last_handle_releases_signal() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, "x");
        let clone = signal.clone();

        drop(signal);
        assert_eq!(rt.signal_count(), 1);
        drop(clone);
        assert_eq!(rt.signal_count(), 0);
    }

    #[tokio::test]
    async fn notify_prunes_removed_subscribers() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, 0);
        let runs = Arc::new(AtomicI32::new(0));

        let effect = {
            let (signal, runs) = (signal.clone(), runs.clone());
            Effect::new_in(&rt, move |cx: EffectContext| {
                cx.subscribe(&signal);
                runs.fetch_add(1, Ordering::SeqCst);
                async {}
            })
            .await
        };

        // Drop the table entry behind the graph's back.
        rt.inner.registry.lock().effects.remove(&effect.id());
        assert!(!rt.is_consistent());

        rt.notify(signal.id());
        rt.settle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(rt.subscribers_of(signal.id()), Vec::new());
        assert!(rt.is_consistent());
    }

    #[tokio::test]
    async fn settle_waits_for_queued_runs() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, 0);
        let runs = Arc::new(AtomicI32::new(0));

        let _effect = {
            let (signal, runs) = (signal.clone(), runs.clone());
            Effect::new_in(&rt, move |cx: EffectContext| {
                let signal = cx.subscribe(&signal);
                let runs = runs.clone();
                async move {
                    tokio::task::yield_now().await;
                    let _ = signal.get();
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
        };

        signal.set(1);
        assert_eq!(rt.pending_runs(), 1);
        rt.settle().await;
        assert_eq!(rt.pending_runs(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn schedule_without_tokio_is_dropped() {
        let rt = Runtime::default();
        let signal = Signal::new_in(&rt, 0);
        // No subscribers and no tokio runtime: nothing to do, nothing panics.
        assert!(signal.set(1));
        assert_eq!(rt.pending_runs(), 0);
    }

    #[test]
    fn queues_follow_config() {
        let rt = Runtime::new(
            RuntimeConfig::default().with_unique_delay(std::time::Duration::from_millis(9)),
        );
        let queue: UniqueQueue<u8> = rt.unique_queue();
        assert!(format!("{queue:?}").contains("9ms"));
        assert!(rt.fifo_queue().is_empty());
    }
}
