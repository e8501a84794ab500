//! Application callbacks for incoming requests.

use crate::error::{Error, Result};
use crate::payload::Payload;
use crate::protocol::Setup;
use crate::stream::PayloadStream;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of payloads produced by local code.
///
/// An `Err` item terminates the stream with an ERROR frame.
pub type Producer = BoxStream<'static, Result<Payload>>;

/// Handles requests initiated by the peer.
///
/// Every method has a default that rejects the interaction, so handlers only
/// implement the models they serve. Both clients and servers install one,
/// since either side may initiate requests once the connection is up.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Inspects the SETUP frame before the connection is accepted.
    ///
    /// Returning an error rejects the connection with `REJECTED_SETUP`.
    async fn on_setup(&self, _setup: &Setup) -> Result<()> {
        Ok(())
    }

    /// Handles a fire-and-forget message. Errors are only logged.
    async fn fire_and_forget(&self, _payload: Payload) -> Result<()> {
        Err(Error::rejected("fire-and-forget is not supported"))
    }

    /// Handles a request-response exchange.
    async fn request_response(&self, _payload: Payload) -> Result<Payload> {
        Err(Error::rejected("request-response is not supported"))
    }

    /// Handles a request-stream exchange.
    ///
    /// Items from the returned producer are sent only as the requester grants
    /// credit.
    async fn request_stream(&self, _payload: Payload) -> Result<Producer> {
        Err(Error::rejected("request-stream is not supported"))
    }

    /// Handles a request-channel exchange.
    ///
    /// `inbound` yields the requester's payloads, starting with the one
    /// carried by REQUEST_CHANNEL.
    async fn request_channel(&self, _inbound: PayloadStream) -> Result<Producer> {
        Err(Error::rejected("request-channel is not supported"))
    }
}

/// Handler that rejects every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

#[async_trait]
impl RequestHandler for DefaultHandler {}
