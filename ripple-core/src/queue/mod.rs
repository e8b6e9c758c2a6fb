//! Serialization Primitives
//!
//! Tools that order asynchronous work without blocking unrelated work:
//!
//! - [`FifoQueue`]: one global order; every task waits for all earlier ones.
//! - [`UniqueQueue`]: per-key order with coalescing of pending tasks.
//! - [`Channel`]: per-key acquire/resume mutual exclusion with advisory
//!   liveness checks, plus a channel-wide FIFO lane.
//!
//! None of these cancel work preemptively. A task that wants to give up when
//! it has been superseded polls `is_last_on_q` and returns early.

mod channel;
mod completion;
mod fifo;
mod unique;

use std::future::Future;

pub use channel::{Acquire, Channel, LaneKey, Liveness, Permit};
pub use completion::Completion;
pub use fifo::FifoQueue;
pub use unique::UniqueQueue;

use crate::error::{BoxError, Result};
use crate::lazy::Lazy;

static GLOBAL_FIFO: Lazy<Channel<()>> = Lazy::new(Channel::new);

/// Request the process-wide FIFO lane.
///
/// Every caller in the process is admitted in call order.
pub fn global_fifo() -> Acquire<()> {
    GLOBAL_FIFO.fifo()
}

/// Run `body` while holding the process-wide FIFO lane.
pub async fn fifo_callback<T, E, F, Fut>(body: F) -> Result<T>
where
    F: FnOnce(Liveness<()>) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    GLOBAL_FIFO.fifo_callback(body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn global_fifo_admits_in_call_order() {
        let first = global_fifo();
        let second = global_fifo();

        let first = first.await.unwrap();
        assert!(!first.is_last_on_q());
        first.resume();

        let second = second.await.unwrap();
        second.resume();

        let value = fifo_callback(|_| async { Ok::<_, BoxError>(5) }).await.unwrap();
        assert_eq!(value, 5);
    }
}
