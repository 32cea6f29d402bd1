//! Bounded producer queue feeding the send half of a streaming rpc.
//!
//! The stream core appends frames from the worker queue; the transport
//! drains them from whatever thread its flow-control logic runs on, so the
//! whole structure sits behind a mutex. The consumer side is exposed as a
//! [`futures::Stream`] of frames that terminates once the writer is
//! half-closed, which is the shape an HTTP/2 transport wants for a request
//! body.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use bytes::Bytes;
use parking_lot::Mutex;
use tonic::Status;
use tracing::trace;

struct Inner {
    pending: VecDeque<Bytes>,
    finished: bool,
    finish_error: Option<Status>,
    waker: Option<Waker>,
}

/// Mutex-guarded frame queue with an idempotent half-close.
#[derive(Clone)]
pub struct RequestWriter {
    inner: Arc<Mutex<Inner>>,
}

impl RequestWriter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: VecDeque::new(),
                finished: false,
                finish_error: None,
                waker: None,
            })),
        }
    }

    /// Appends one frame. Frames written after the half-close are dropped.
    pub fn write_value(
        &self,
        frame: Bytes,
    ) {
        let mut inner = self.inner.lock();
        if inner.finished {
            trace!("dropping frame written after half-close");
            return;
        }
        inner.pending.push_back(frame);
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    /// Half-closes the writer. Idempotent; the first call wins and later
    /// writes are dropped. Already-buffered frames still drain.
    pub fn finish(
        &self,
        error: Option<Status>,
    ) {
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        inner.finished = true;
        inner.finish_error = error;
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// The error the writer was finished with, if any.
    pub fn finish_error(&self) -> Option<Status> {
        self.inner.lock().finish_error.clone()
    }

    /// Non-blocking pop of the next buffered frame. Transports that poll
    /// rather than await (and the test rig) use this instead of the
    /// [`futures::Stream`] impl.
    pub fn try_next(&self) -> Option<Bytes> {
        self.inner.lock().pending.pop_front()
    }
}

impl Default for RequestWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl futures::Stream for RequestWriter {
    type Item = Bytes;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Bytes>> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.pending.pop_front() {
            return Poll::Ready(Some(frame));
        }
        if inner.finished {
            return Poll::Ready(None);
        }
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl std::fmt::Debug for RequestWriter {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RequestWriter")
            .field("pending", &inner.pending.len())
            .field("finished", &inner.finished)
            .finish()
    }
}
