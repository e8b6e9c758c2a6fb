//! Ripple Core
//!
//! This crate provides the core of the Ripple reactive engine. It implements:
//!
//! - Reactive primitives (signals, derived values, effects) with dependency
//!   tracking discovered at run time
//! - Serialization primitives that order asynchronous work globally or per
//!   key without blocking unrelated keys
//! - A lazy construction cell used for process-wide singletons
//!
//! Everything runs on tokio. Effects re-run as spawned tasks, so signal
//! writes that have subscribers must happen inside a tokio runtime.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Signals, effects, derived values and the runtime that
//!   schedules them
//! - `graph`: The bidirectional signal/effect edge store
//! - `queue`: FIFO queue, keyed unique queue and channel
//! - `lazy`: Deferred construction cell
//! - `config`, `error`: Runtime configuration and the shared error type
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::reactive::{Derived, Effect, Signal};
//!
//! let count = Signal::new(0);
//!
//! let doubled = Derived::new({
//!     let count = count.clone();
//!     move |cx| {
//!         let count = cx.subscribe(&count);
//!         async move { count.get() * 2 }
//!     }
//! })
//! .await;
//!
//! let _log = Effect::new({
//!     let doubled = doubled.clone();
//!     move |cx| {
//!         let doubled = cx.subscribe(&doubled);
//!         async move { println!("doubled: {}", doubled.get()) }
//!     }
//! })
//! .await;
//!
//! count.set(5);
//! // Effects run in the background, prints: "doubled: 10"
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod lazy;
pub mod queue;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use reactive::{Derived, Effect, EffectContext, Runtime, Signal};
