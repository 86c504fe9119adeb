//! Pull-based request body
//!
//! A chunk can be hundreds of MiB. Rather than handing the whole buffer to
//! the transport, the body is exposed as a lazy, finite, non-restartable
//! stream of small windows that the transport polls as the socket drains.
//! Each window is a zero-copy slice of the chunk, and progress is counted as
//! windows are pulled.

use crate::progress::{ProgressStream, ProgressTracker};
use bytes::Bytes;
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Fixed-size windows over one in-memory buffer
#[derive(Debug)]
pub struct ChunkWindows {
    data: Bytes,
    window: usize,
    position: usize,
    finished: bool,
}

impl ChunkWindows {
    pub fn new(data: Bytes, window: usize) -> Self {
        Self {
            data,
            window: window.max(1),
            position: 0,
            finished: false,
        }
    }

    /// True once end-of-stream has been signalled
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for ChunkWindows {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.position >= self.data.len() {
            self.finished = true;
            return Poll::Ready(None);
        }

        let end = (self.position + self.window).min(self.data.len());
        let window = self.data.slice(self.position..end);
        self.position = end;
        Poll::Ready(Some(Ok(window)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.data.len() - self.position).div_ceil(self.window);
        (remaining, Some(remaining))
    }
}

/// Request body for one chunk, with its exact length known up front
pub struct StreamingRequestBody {
    content_length: u64,
    stream: ProgressStream<ChunkWindows>,
}

impl StreamingRequestBody {
    pub fn new(data: Bytes, window: usize, tracker: Arc<ProgressTracker>) -> Self {
        Self::resend(data, window, tracker, 0)
    }

    /// Body whose first `already_counted` bytes were reported by an earlier
    /// request and must not advance the tracker again
    pub fn resend(
        data: Bytes,
        window: usize,
        tracker: Arc<ProgressTracker>,
        already_counted: u64,
    ) -> Self {
        let content_length = data.len() as u64;
        Self {
            content_length,
            stream: ProgressStream::with_uncounted(
                ChunkWindows::new(data, window),
                tracker,
                already_counted,
            ),
        }
    }

    /// Value for the `Content-Length` header
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Hand the body to reqwest; the transport drives the polling
    pub fn into_body(self) -> reqwest::Body {
        if self.content_length == 0 {
            return reqwest::Body::from(Bytes::new());
        }
        reqwest::Body::wrap_stream(self.stream)
    }
}

impl Stream for StreamingRequestBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_windows_cover_chunk() {
        let data = Bytes::from((0..20_000u32).map(|i| i as u8).collect::<Vec<u8>>());
        let mut windows = ChunkWindows::new(data.clone(), 8192);

        let mut sizes = Vec::new();
        let mut joined = Vec::new();
        while let Some(window) = windows.next().await {
            let window = window.unwrap();
            sizes.push(window.len());
            joined.extend_from_slice(&window);
        }

        assert_eq!(sizes, vec![8192, 8192, 3616]);
        assert_eq!(joined, data.to_vec());
        assert!(windows.is_finished());
    }

    #[tokio::test]
    async fn test_completion_signalled_once_and_stays_done() {
        let mut windows = ChunkWindows::new(Bytes::from_static(b"abc"), 2);
        assert!(windows.next().await.is_some());
        assert!(windows.next().await.is_some());
        assert!(windows.next().await.is_none());
        assert!(windows.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_chunk_ends_immediately() {
        let mut windows = ChunkWindows::new(Bytes::new(), 8192);
        assert!(windows.next().await.is_none());
        assert!(windows.is_finished());
    }

    #[tokio::test]
    async fn test_body_reports_progress_per_pull() {
        let tracker = Arc::new(ProgressTracker::new(10, false));
        let mut body = StreamingRequestBody::new(Bytes::from_static(b"0123456789"), 4, tracker.clone());
        assert_eq!(body.content_length(), 10);
        assert_eq!(tracker.transferred_bytes(), 0);

        body.next().await.unwrap().unwrap();
        assert_eq!(tracker.transferred_bytes(), 4);

        body.next().await.unwrap().unwrap();
        body.next().await.unwrap().unwrap();
        assert!(body.next().await.is_none());
        assert_eq!(tracker.transferred_bytes(), 10);
    }

    #[test]
    fn test_windows_never_pending() {
        let mut windows = tokio_test::task::spawn(ChunkWindows::new(Bytes::from_static(b"abcd"), 3));

        let first = tokio_test::assert_ready!(windows.poll_next());
        assert_eq!(first.unwrap().unwrap().len(), 3);
        let second = tokio_test::assert_ready!(windows.poll_next());
        assert_eq!(second.unwrap().unwrap().len(), 1);
        assert!(tokio_test::assert_ready!(windows.poll_next()).is_none());
    }

    #[test]
    fn test_size_hint_counts_windows() {
        let windows = ChunkWindows::new(Bytes::from(vec![0u8; 10]), 4);
        assert_eq!(windows.size_hint(), (3, Some(3)));
    }
}
