use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::{Stream, stream::BoxStream};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A periodic poller exposed as a stream of non-empty batches.
///
/// The poll function runs lazily: the next poll only starts once the
/// previous batch has been taken from the stream, so a record handed out in
/// one batch cannot be handed out again before its caller updated it.
///
/// The stream ends when the cancellation token fires.
pub struct Poller<T> {
    stream: BoxStream<'static, Result<Vec<T>, tower::BoxError>>,
}

impl<T> Stream for Poller<T> {
    type Item = Result<Vec<T>, tower::BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// Builder for creating a `Poller`.
pub struct PollerBuilder {
    interval: Duration,
}

impl PollerBuilder {
    /// Create a new `PollerBuilder` with the specified polling interval.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start polling.
    ///
    /// `poll_fn` is called once per tick; empty batches are skipped and
    /// errors are yielded as they come, without stopping the poller.
    pub fn start<T, F, Fut>(self, cancel: CancellationToken, mut poll_fn: F) -> Poller<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<T>, tower::BoxError>> + Send,
    {
        let interval = self.interval;

        let stream = async_stream::stream! {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match poll_fn().await {
                    Ok(items) if items.is_empty() => continue,
                    batch => yield batch,
                }
            }
        };

        Poller {
            stream: Box::pin(stream),
        }
    }
}
