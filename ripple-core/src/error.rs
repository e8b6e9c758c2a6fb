//! Error types shared by the reactive graph and the serialization primitives.

use std::error::Error as StdError;

use crate::graph::{EffectId, SignalId};

/// Boxed error carried by failed tasks.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by fallible Ripple operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The signal was released with `unref` and can no longer be used.
    #[error("signal {0} has been released")]
    Released(SignalId),

    /// The signal has not been given a value yet. Happens for a derived value
    /// whose first computation failed.
    #[error("signal {0} has no value yet")]
    Uninitialized(SignalId),

    /// A pending task was replaced by a newer task for the same key before it
    /// started.
    #[error("task was superseded by a newer task for the same key")]
    Superseded,

    /// The task or waiter was dropped before it could complete.
    #[error("task was abandoned before completion")]
    Abandoned,

    /// A task body run under a channel lane failed.
    #[error("task failed: {0}")]
    Task(#[source] BoxError),

    /// An effect body returned an error.
    #[error("effect {effect} failed: {message}")]
    EffectFailed {
        /// The effect whose run failed.
        effect: EffectId,
        /// Rendered error returned by the body.
        message: String,
    },

    /// An effect body panicked.
    #[error("effect {effect} panicked: {message}")]
    EffectPanicked {
        /// The effect whose run panicked.
        effect: EffectId,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an arbitrary task error.
    pub fn task<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Task(error.into())
    }
}
