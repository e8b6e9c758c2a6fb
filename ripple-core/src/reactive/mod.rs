//! Reactive Primitives
//!
//! This module implements the reactive graph: signals, derived values, and
//! effects. Together they keep state and the work that depends on it in sync.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. Writing a different value
//! notifies every effect subscribed to it; writing an equal value does
//! nothing.
//!
//! ## Effects
//!
//! An Effect is an asynchronous computation that re-runs whenever one of its
//! dependencies changes. Dependencies are discovered at run time, either
//! through explicit `subscribe` calls on the [`EffectContext`] or by
//! recording every signal read during the run.
//!
//! ## Derived Values
//!
//! A Derived is a signal written only by its own internal effect. It can be
//! read and subscribed to, but not set from outside.
//!
//! # Implementation Notes
//!
//! Signals and effects do not point at each other. The [`Runtime`] keeps an
//! arena of effects and a bidirectional edge index between ids, so removing
//! either side is a table update rather than a walk over shared references.
//! Read capture for auto effects uses a tokio task-local, so it follows the
//! run across await points and never leaks between concurrent runs.

mod context;
mod derived;
mod effect;
mod runtime;
mod signal;

pub use context::CaptureScope;
pub use derived::Derived;
pub use effect::{CaptureMode, Effect, EffectContext, EffectOutcome, EffectState};
pub use runtime::Runtime;
pub use signal::{Observable, Signal};
