//! Byte-counting stream decorator

use super::ProgressTracker;
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pin_project! {
    /// Stream wrapper that reports every delivered buffer to a [`ProgressTracker`]
    ///
    /// Bytes are counted when the consumer pulls them, not when the source
    /// produces them, so progress follows the transport. The first
    /// `uncounted` bytes are delivered without being reported.
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        tracker: Arc<ProgressTracker>,
        delivered: u64,
        uncounted: u64,
    }
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    pub fn new(inner: S, tracker: Arc<ProgressTracker>) -> Self {
        Self::with_uncounted(inner, tracker, 0)
    }

    /// Wrap a stream whose leading `uncounted` bytes were already reported,
    /// e.g. a range re-sent after the server persisted less than it received
    pub fn with_uncounted(inner: S, tracker: Arc<ProgressTracker>, uncounted: u64) -> Self {
        Self {
            inner,
            tracker,
            delivered: 0,
            uncounted,
        }
    }

    /// Bytes handed to the consumer so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let len = bytes.len() as u64;
                *this.delivered += len;
                let skipped = len.min(*this.uncounted);
                *this.uncounted -= skipped;
                if len > skipped {
                    this.tracker.update(len - skipped);
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
