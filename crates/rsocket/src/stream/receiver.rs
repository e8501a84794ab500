//! Consumer handle for inbound payload streams.

use crate::error::{Error, Result};
use crate::multiplexer::Multiplexer;
use crate::payload::Payload;
use crate::protocol::StreamId;

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Payloads received on one stream.
///
/// Ends after the peer completes the stream; yields one `Err` item and then
/// ends if the stream fails. Dropping the handle before the end cancels the
/// stream.
pub struct PayloadStream {
    stream_id: StreamId,
    rx: UnboundedReceiverStream<Result<Payload>>,
    mux: Option<Arc<Multiplexer>>,
    done: bool,
}

impl PayloadStream {
    pub(crate) fn new(
        stream_id: StreamId,
        rx: mpsc::UnboundedReceiver<Result<Payload>>,
        mux: Arc<Multiplexer>,
    ) -> Self {
        Self {
            stream_id,
            rx: UnboundedReceiverStream::new(rx),
            mux: Some(mux),
            done: false,
        }
    }

    /// A stream that yields `err` and ends.
    pub(crate) fn failed(err: Error) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Err(err));
        Self {
            stream_id: 0,
            rx: UnboundedReceiverStream::new(rx),
            mux: None,
            done: false,
        }
    }

    /// The stream id, or 0 if the stream never opened.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Asks the peer for `n` more payloads.
    pub fn request(&self, n: u32) {
        if let Some(mux) = &self.mux {
            mux.request_n(self.stream_id, n);
        }
    }

    /// Cancels the stream. Payloads already received are still yielded.
    pub fn cancel(&mut self) {
        if let Some(mux) = self.mux.take() {
            mux.cancel_inbound(self.stream_id);
        }
    }
}

impl Stream for PayloadStream {
    type Item = Result<Payload>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.rx).poll_next(cx) {
            Poll::Ready(None) => {
                self.done = true;
                self.mux = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for PayloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStream")
            .field("stream_id", &self.stream_id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
