//! Deferred result of a request-response exchange.

use crate::error::{Error, Result};
use crate::multiplexer::Multiplexer;
use crate::payload::Payload;
use crate::protocol::StreamId;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Resolves to the single response of a request-response exchange.
///
/// Dropping it before it resolves cancels the request.
pub struct PendingResponse {
    stream_id: StreamId,
    rx: oneshot::Receiver<Result<Payload>>,
    mux: Option<Arc<Multiplexer>>,
}

impl PendingResponse {
    pub(crate) const fn new(
        stream_id: StreamId,
        rx: oneshot::Receiver<Result<Payload>>,
        mux: Arc<Multiplexer>,
    ) -> Self {
        Self {
            stream_id,
            rx,
            mux: Some(mux),
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self {
            stream_id: 0,
            rx,
            mux: None,
        }
    }

    /// The stream id, or 0 if the request never went out.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Cancels the request.
    ///
    /// If no response has arrived yet the peer is sent CANCEL and awaiting
    /// this value yields a `Canceled` error. Otherwise this is a no-op.
    pub fn cancel(&mut self) {
        if let Some(mux) = self.mux.take() {
            mux.cancel_inbound(self.stream_id);
        }
    }
}

impl Future for PendingResponse {
    type Output = Result<Payload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };
        self.mux = None;
        Poll::Ready(result.unwrap_or(Err(Error::ConnectionClosed)))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}
