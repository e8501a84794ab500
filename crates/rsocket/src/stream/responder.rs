//! Responder tasks, one per peer-initiated stream.

use super::credit::Credit;
use super::machine::Signal;
use super::producer::{drive, flatten_panic};
use super::receiver::PayloadStream;
use crate::error::HandlerError;
use crate::handler::RequestHandler;
use crate::multiplexer::Multiplexer;
use crate::payload::Payload;
use crate::protocol::StreamId;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

pub(crate) async fn fire_and_forget(
    handler: Arc<dyn RequestHandler>,
    stream_id: StreamId,
    payload: Payload,
) {
    match AssertUnwindSafe(handler.fire_and_forget(payload))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => trace!(stream_id, "fire-and-forget handled"),
        Ok(Err(err)) => warn!(stream_id, error = %err, "fire-and-forget handler failed"),
        Err(panic) => error!(
            stream_id,
            error = %HandlerError::from_panic(&*panic),
            "fire-and-forget handler panicked"
        ),
    }
}

pub(crate) async fn request_response(
    mux: Arc<Multiplexer>,
    handler: Arc<dyn RequestHandler>,
    stream_id: StreamId,
    payload: Payload,
    token: CancellationToken,
) {
    let response = tokio::select! {
        biased;
        () = token.cancelled() => {
            debug!(stream_id, "request-response canceled before the handler finished");
            return;
        }
        response = AssertUnwindSafe(handler.request_response(payload)).catch_unwind() => response,
    };

    let signal = match flatten_panic(response) {
        Ok(payload) => Signal::Next(payload),
        Err(err) => Signal::Error(err),
    };
    if let Err(err) = mux.emit(stream_id, signal).await {
        debug!(stream_id, error = %err, "response dropped");
    }
}

pub(crate) async fn request_stream(
    mux: Arc<Multiplexer>,
    handler: Arc<dyn RequestHandler>,
    stream_id: StreamId,
    payload: Payload,
    credit: Arc<Credit>,
    token: CancellationToken,
) {
    let source = tokio::select! {
        biased;
        () = token.cancelled() => return,
        source = AssertUnwindSafe(handler.request_stream(payload)).catch_unwind() => source,
    };

    match flatten_panic(source) {
        Ok(source) => drive(mux, stream_id, source, credit, token).await,
        Err(err) => {
            if let Err(err) = mux.emit(stream_id, Signal::Error(err)).await {
                debug!(stream_id, error = %err, "stream already terminated");
            }
        }
    }
}

pub(crate) async fn request_channel(
    mux: Arc<Multiplexer>,
    handler: Arc<dyn RequestHandler>,
    stream_id: StreamId,
    inbound: PayloadStream,
    credit: Arc<Credit>,
    token: CancellationToken,
) {
    let source = tokio::select! {
        biased;
        () = token.cancelled() => return,
        source = AssertUnwindSafe(handler.request_channel(inbound)).catch_unwind() => source,
    };

    match flatten_panic(source) {
        Ok(source) => drive(mux, stream_id, source, credit, token).await,
        Err(err) => {
            if let Err(err) = mux.emit(stream_id, Signal::Error(err)).await {
                debug!(stream_id, error = %err, "channel already terminated");
            }
        }
    }
}
