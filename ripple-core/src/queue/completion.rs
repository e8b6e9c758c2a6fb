//! Completion handles returned by the task queues.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Resolves with the output of a queued task.
///
/// If the task is dropped before it produces a value, the handle resolves to
/// the error chosen by the queue: [`Error::Superseded`] for a unique queue
/// slot that was replaced, [`Error::Abandoned`] otherwise.
#[must_use = "a completion does nothing unless awaited"]
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
    dropped: fn() -> Error,
}

impl<T> Completion<T> {
    pub(crate) fn new(rx: oneshot::Receiver<T>, dropped: fn() -> Error) -> Self {
        Self { rx, dropped }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let dropped = self.dropped;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| dropped()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_sent_value() {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, || Error::Abandoned);
        tx.send(5).unwrap();
        assert_eq!(completion.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn dropped_sender_maps_to_error() {
        let (tx, rx) = oneshot::channel::<u8>();
        let completion = Completion::new(rx, || Error::Superseded);
        drop(tx);
        assert!(matches!(completion.await, Err(Error::Superseded)));
    }
}
