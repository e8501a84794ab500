//! Credit-gated emission of local payload sources.

use super::credit::Credit;
use super::machine::Signal;
use crate::error::{HandlerError, Result};
use crate::handler::Producer;
use crate::multiplexer::Multiplexer;
use crate::payload::Payload;
use crate::protocol::StreamId;

use futures::{FutureExt, Stream, StreamExt};
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Collapses a caught panic into a handler error.
pub(crate) fn flatten_panic<T>(outcome: std::thread::Result<Result<T>>) -> Result<T> {
    outcome.unwrap_or_else(|panic| Err(HandlerError::from_panic(&*panic).into()))
}

async fn finish(mux: &Multiplexer, stream_id: StreamId, signal: Signal) {
    if let Err(err) = mux.emit(stream_id, signal).await {
        debug!(stream_id, error = %err, "stream already terminated");
    }
}

/// Emits `source` on `stream_id`, one payload per credit.
///
/// Completion and errors are sent without waiting for credit. Every payload
/// waits for room in the connection's write queue and spends task budget, so
/// an always-ready source with unbounded credit still yields to the runtime.
/// Stops as soon as `token` is canceled.
pub(crate) async fn drive<S>(
    mux: Arc<Multiplexer>,
    stream_id: StreamId,
    source: S,
    credit: Arc<Credit>,
    token: CancellationToken,
) where
    S: Stream<Item = Result<Payload>> + Send,
{
    let mut source = pin!(AssertUnwindSafe(source).catch_unwind());

    loop {
        let item = tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(stream_id, "producer canceled");
                return;
            }
            item = source.next() => item,
        };

        let payload = match item {
            Some(Ok(Ok(payload))) => payload,
            Some(Ok(Err(err))) => {
                debug!(stream_id, error = %err, "producer failed");
                finish(&mux, stream_id, Signal::Error(err)).await;
                return;
            }
            Some(Err(panic)) => {
                let err = HandlerError::from_panic(&*panic);
                error!(stream_id, error = %err, "producer panicked");
                finish(&mux, stream_id, Signal::Error(err.into())).await;
                return;
            }
            None => {
                finish(&mux, stream_id, Signal::Complete).await;
                return;
            }
        };

        tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(stream_id, "producer canceled while waiting for credit");
                return;
            }
            () = credit.acquire() => {}
        }

        let sent = tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(stream_id, "producer canceled while the write queue was full");
                return;
            }
            sent = mux.emit(stream_id, Signal::Next(payload)) => sent,
        };
        if let Err(err) = sent {
            debug!(stream_id, error = %err, "stopping producer");
            return;
        }

        tokio::task::consume_budget().await;
    }
}

/// Opens a requester channel with its first payload, then drives the rest.
pub(crate) async fn drive_channel_requester(
    mux: Arc<Multiplexer>,
    stream_id: StreamId,
    mut outbound: Producer,
    initial_request_n: u32,
    credit: Arc<Credit>,
    token: CancellationToken,
) {
    let first = tokio::select! {
        biased;
        () = token.cancelled() => return,
        first = AssertUnwindSafe(outbound.next()).catch_unwind() => first,
    };

    let first = match first {
        Ok(Some(Ok(payload))) => Some(payload),
        Ok(None) => None,
        Ok(Some(Err(err))) => {
            mux.abort_stream(stream_id, err);
            return;
        }
        Err(panic) => {
            mux.abort_stream(stream_id, HandlerError::from_panic(&*panic).into());
            return;
        }
    };

    let has_more = first.is_some();
    if let Err(err) = mux.open_channel(stream_id, first, initial_request_n) {
        debug!(stream_id, error = %err, "channel closed before it opened");
        return;
    }
    if has_more {
        drive(mux, stream_id, outbound, credit, token).await;
    }
}
