//! Dependency Graph
//!
//! This module implements the bidirectional graph that links signals to the
//! effects observing them.
//!
//! # Overview
//!
//! The graph stores two maps that mirror each other exactly:
//!
//! - effect -> the set of signals it depends on
//! - signal -> the set of effects subscribed to it
//!
//! Signals and effects themselves live elsewhere (the runtime's arena); the
//! graph only stores their indices. This keeps ownership acyclic: a signal
//! never holds its subscribers and an effect never holds its sources.
//!
//! # Design Decisions
//!
//! 1. Every mutation updates both maps before returning, so the graph can
//!    never be observed in a half-updated state by a caller holding the lock.
//!
//! 2. Edge sets are `IndexSet`s, so subscribers are notified in the order
//!    they subscribed.
//!
//! 3. Replacing an effect's dependency set is a single call that computes
//!    the stale and new edges first and then applies both sides.

mod dependency;
mod node;

pub use dependency::DependencyGraph;
pub use node::{EffectId, SignalId};
