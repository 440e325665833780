//! Tee body: capture a byte stream for asynchronous observation.
//!
//! Wraps an `http_body::Body` and appends every data frame that flows
//! through it to an internal buffer. When the stream finishes (end of
//! stream, error, cancellation or drop) the captured bytes are handed
//! exactly once to an observer callback running on its own task.
//!
//! The primary consumer is never delayed: reads drain immediately into
//! the buffer and observation starts only after the consumer is done.
//! An earlier pipe-based design stalled the upstream→client path whenever
//! observation lagged; buffering decouples the two completely.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http_body::{Body, Frame, SizeHint};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::error;

/// Observer invoked with the captured bytes once the stream ends.
pub type Observer = Box<dyn FnOnce(Bytes) -> BoxFuture<'static, ()> + Send + 'static>;

/// Box an async observer closure into the [`Observer`] shape.
pub fn observer<F, Fut>(f: F) -> Observer
where
    F: FnOnce(Bytes) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Box::new(move |bytes| f(bytes).boxed())
}

/// A body wrapper that tees every data frame into a capture buffer.
pub struct TeeBody<B> {
    inner: B,
    captured: BytesMut,
    observer: Option<Observer>,
    cancel: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    done: bool,
}

impl<B> TeeBody<B> {
    pub fn new(inner: B, observer: Observer) -> Self {
        Self::with_size_hint(inner, 0, observer)
    }

    /// `size_hint` pre-sizes the capture buffer; blob-scale payloads are
    /// multi-megabyte and reallocation on the copy path is measurable.
    pub fn with_size_hint(inner: B, size_hint: usize, observer: Observer) -> Self {
        Self {
            inner,
            captured: BytesMut::with_capacity(size_hint),
            observer: Some(observer),
            cancel: None,
            done: false,
        }
    }

    /// Terminate the stream when `token` is cancelled. Used on response
    /// bodies so deadline expiry unblocks the client copy.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(Box::pin(token.cancelled_owned()));
        self
    }

    /// Hand the captured bytes to the observer on a fresh task. Runs at
    /// most once; panics inside the observer are caught and logged.
    fn finish(&mut self) {
        self.done = true;

        let Some(observer) = self.observer.take() else {
            return;
        };

        let bytes = std::mem::take(&mut self.captured).freeze();

        // finish() can run from Drop; only spawn when a runtime is still
        // around (it always is on the proxy path).
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        handle.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(observer(bytes)).catch_unwind().await {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %reason, "uncaught panic in body observer");
            }
        });
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if this.done {
            return Poll::Ready(None);
        }

        // Poll (not just check) the cancellation future so the token
        // wakes a parked stream.
        if let Some(cancel) = &mut this.cancel {
            if cancel.as_mut().poll(cx).is_ready() {
                this.finish();
                return Poll::Ready(None);
            }
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.captured.extend_from_slice(data);
                }

                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err.into())))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for TeeBody<B> {
    fn drop(&mut self) {
        // A dropped stream (client disconnect, cancellation upstream of
        // us) still observes whatever was captured.
        if self.observer.is_some() {
            self.finish();
        }
    }
}
