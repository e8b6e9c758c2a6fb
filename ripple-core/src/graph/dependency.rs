//! Dependency Graph Storage
//!
//! The graph keeps forward edges (effect -> signals it reads) and reverse
//! edges (signal -> effects to notify). Both directions are updated together
//! by every method here.
//!
//! # Commit Model
//!
//! An effect run produces a new dependency set. [`DependencyGraph::replace`]
//! applies it in one step:
//!
//! 1. Diff the new set against the current one
//! 2. Remove the reverse edge of every stale signal
//! 3. Add the reverse edge of every new signal
//! 4. Store the new forward set
//!
//! A failed run simply never calls `replace`, so the previous set stays in
//! place.

use std::collections::HashMap;

use indexmap::IndexSet;

use super::node::{EffectId, SignalId};

/// Bidirectional signal <-> effect edge store.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Signals each effect depends on.
    dependencies: HashMap<EffectId, IndexSet<SignalId>>,

    /// Effects subscribed to each signal, in subscription order.
    subscribers: HashMap<SignalId, IndexSet<EffectId>>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge: `effect` depends on `signal`.
    ///
    /// Returns `true` if the edge was not present before.
    pub fn link(&mut self, effect: EffectId, signal: SignalId) -> bool {
        let added = self.dependencies.entry(effect).or_default().insert(signal);
        self.subscribers.entry(signal).or_default().insert(effect);
        added
    }

    /// Remove the edge between `effect` and `signal`.
    ///
    /// Returns `true` if the edge existed.
    pub fn unlink(&mut self, effect: EffectId, signal: SignalId) -> bool {
        let removed = match self.dependencies.get_mut(&effect) {
            Some(deps) => {
                let removed = deps.shift_remove(&signal);
                if deps.is_empty() {
                    self.dependencies.remove(&effect);
                }
                removed
            }
            None => false,
        };
        if let Some(subs) = self.subscribers.get_mut(&signal) {
            subs.shift_remove(&effect);
            if subs.is_empty() {
                self.subscribers.remove(&signal);
            }
        }
        removed
    }

    /// Replace the full dependency set of an effect.
    pub fn replace(&mut self, effect: EffectId, signals: IndexSet<SignalId>) {
        let current = self.dependencies.remove(&effect).unwrap_or_default();

        for stale in current.difference(&signals) {
            self.remove_subscriber(*stale, effect);
        }
        for fresh in signals.difference(&current) {
            self.subscribers.entry(*fresh).or_default().insert(effect);
        }

        if !signals.is_empty() {
            self.dependencies.insert(effect, signals);
        }
    }

    /// Keep only the dependencies of `effect` that are in `keep`.
    ///
    /// Returns the signals that were pruned.
    pub fn retain(&mut self, effect: EffectId, keep: &IndexSet<SignalId>) -> Vec<SignalId> {
        let Some(deps) = self.dependencies.get_mut(&effect) else {
            return Vec::new();
        };

        let stale: Vec<SignalId> = deps.iter().filter(|s| !keep.contains(*s)).copied().collect();
        deps.retain(|s| keep.contains(s));
        if deps.is_empty() {
            self.dependencies.remove(&effect);
        }

        for signal in &stale {
            self.remove_subscriber(*signal, effect);
        }
        stale
    }

    /// Remove every edge of an effect.
    ///
    /// Returns the signals it was linked to.
    pub fn detach_effect(&mut self, effect: EffectId) -> IndexSet<SignalId> {
        let deps = self.dependencies.remove(&effect).unwrap_or_default();
        for signal in &deps {
            self.remove_subscriber(*signal, effect);
        }
        deps
    }

    /// Remove every edge of a signal.
    ///
    /// Returns the effects that were subscribed to it.
    pub fn detach_signal(&mut self, signal: SignalId) -> IndexSet<EffectId> {
        let subs = self.subscribers.remove(&signal).unwrap_or_default();
        for effect in &subs {
            if let Some(deps) = self.dependencies.get_mut(effect) {
                deps.shift_remove(&signal);
                if deps.is_empty() {
                    self.dependencies.remove(effect);
                }
            }
        }
        subs
    }

    /// Signals an effect depends on.
    pub fn dependencies(&self, effect: EffectId) -> Option<&IndexSet<SignalId>> {
        self.dependencies.get(&effect)
    }

    /// Effects subscribed to a signal.
    pub fn subscribers(&self, signal: SignalId) -> Option<&IndexSet<EffectId>> {
        self.subscribers.get(&signal)
    }

    /// Number of signals an effect depends on.
    pub fn dependency_count(&self, effect: EffectId) -> usize {
        self.dependencies.get(&effect).map_or(0, IndexSet::len)
    }

    /// Number of effects subscribed to a signal.
    pub fn subscriber_count(&self, signal: SignalId) -> usize {
        self.subscribers.get(&signal).map_or(0, IndexSet::len)
    }

    /// Check whether the edge `effect -> signal` exists.
    pub fn contains(&self, effect: EffectId, signal: SignalId) -> bool {
        self.dependencies
            .get(&effect)
            .is_some_and(|deps| deps.contains(&signal))
    }

    /// Effects with at least one dependency.
    pub fn effects(&self) -> impl Iterator<Item = EffectId> + '_ {
        self.dependencies.keys().copied()
    }

    /// Signals with at least one subscriber.
    pub fn signals(&self) -> impl Iterator<Item = SignalId> + '_ {
        self.subscribers.keys().copied()
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(IndexSet::len).sum()
    }

    /// Verify that both maps mirror each other exactly and hold no empty
    /// sets.
    pub fn is_symmetric(&self) -> bool {
        let forward = self.dependencies.iter().all(|(effect, deps)| {
            !deps.is_empty()
                && deps.iter().all(|signal| {
                    self.subscribers
                        .get(signal)
                        .is_some_and(|subs| subs.contains(effect))
                })
        });
        let reverse = self.subscribers.iter().all(|(signal, subs)| {
            !subs.is_empty()
                && subs.iter().all(|effect| {
                    self.dependencies
                        .get(effect)
                        .is_some_and(|deps| deps.contains(signal))
                })
        });
        forward && reverse
    }

    fn remove_subscriber(&mut self, signal: SignalId, effect: EffectId) {
        if let Some(subs) = self.subscribers.get_mut(&signal) {
            subs.shift_remove(&effect);
            if subs.is_empty() {
                self.subscribers.remove(&signal);
            }
        }
    }
}
