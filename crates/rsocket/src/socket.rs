//! The connection handle and its builder.

use crate::config::{ConnectionConfig, SetupConfig};
use crate::error::{Error, Result};
use crate::handler::{DefaultHandler, Producer, RequestHandler};
use crate::multiplexer::{Keepalive, Multiplexer, WriterQueues};
use crate::payload::Payload;
use crate::protocol::Frame;
use crate::registry::Role;
use crate::stream::{PayloadStream, PendingResponse};

use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tracing::info;
use uuid::Uuid;

/// One end of an RSocket connection.
///
/// Both ends can initiate all four interaction models; requests initiated by
/// the peer are served by the [`RequestHandler`] installed when the socket
/// was built. Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct RSocket {
    mux: Arc<Multiplexer>,
}

impl RSocket {
    /// Starts building a socket.
    #[must_use]
    pub fn builder() -> RSocketBuilder {
        RSocketBuilder::default()
    }

    /// Unique id of this connection, used in logs.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.mux.id()
    }

    /// Whether this end sent or accepted SETUP.
    #[must_use]
    pub fn role(&self) -> Role {
        self.mux.role()
    }

    /// Sends a one-way message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is gone.
    pub fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        self.mux.fire_and_forget(payload)
    }

    /// Sends a request expecting exactly one response.
    ///
    /// The request goes out immediately; await the returned value for the
    /// response.
    #[must_use = "dropping the pending response cancels the request"]
    pub fn request_response(&self, payload: Payload) -> PendingResponse {
        self.mux.request_response(payload)
    }

    /// Sends a request expecting a stream of responses, granting the
    /// configured default credit.
    #[must_use = "dropping the stream cancels the request"]
    pub fn request_stream(&self, payload: Payload) -> PayloadStream {
        self.request_stream_with(payload, self.mux.config().request_n)
    }

    /// Sends a request expecting a stream of responses, granting
    /// `initial_request_n` credit up front.
    #[must_use = "dropping the stream cancels the request"]
    pub fn request_stream_with(&self, payload: Payload, initial_request_n: u32) -> PayloadStream {
        self.mux.request_stream(payload, initial_request_n)
    }

    /// Opens a channel, sending `outbound` as the peer grants credit.
    ///
    /// The first outbound payload travels in the REQUEST_CHANNEL frame.
    #[must_use = "dropping the stream cancels the inbound direction"]
    pub fn request_channel<S>(&self, outbound: S) -> PayloadStream
    where
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        self.request_channel_with(outbound, self.mux.config().request_n)
    }

    /// Opens a channel granting `initial_request_n` credit to the responder.
    #[must_use = "dropping the stream cancels the inbound direction"]
    pub fn request_channel_with<S>(&self, outbound: S, initial_request_n: u32) -> PayloadStream
    where
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        let outbound: Producer = outbound.boxed();
        self.mux.request_channel(outbound, initial_request_n)
    }

    /// Number of streams still live on this connection.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.mux.active_streams()
    }

    /// Returns true once the connection is closing or closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Closes the connection. Live streams fail with
    /// [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.mux.close();
    }

    /// Waits until the connection is closed.
    ///
    /// # Errors
    ///
    /// Returns the protocol error that terminated the connection, if any.
    pub async fn closed(&self) -> Result<()> {
        self.mux.closed().await
    }
}

impl fmt::Debug for RSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RSocket")
            .field("id", &self.mux.id())
            .field("role", &self.mux.role())
            .finish_non_exhaustive()
    }
}

type HandlerFactory = Box<dyn FnOnce(RSocket) -> Arc<dyn RequestHandler> + Send>;

enum HandlerSource {
    Handler(Arc<dyn RequestHandler>),
    Factory(HandlerFactory),
}

impl HandlerSource {
    fn build(self, socket: RSocket) -> Arc<dyn RequestHandler> {
        match self {
            Self::Handler(handler) => handler,
            Self::Factory(factory) => factory(socket),
        }
    }
}

/// Builder for [`RSocket`].
pub struct RSocketBuilder {
    setup: SetupConfig,
    config: ConnectionConfig,
    runtime: Option<Handle>,
    handler: HandlerSource,
}

impl Default for RSocketBuilder {
    fn default() -> Self {
        Self {
            setup: SetupConfig::default(),
            config: ConnectionConfig::default(),
            runtime: None,
            handler: HandlerSource::Handler(Arc::new(DefaultHandler)),
        }
    }
}

impl RSocketBuilder {
    /// Sets the SETUP parameters a client announces.
    #[must_use]
    pub fn setup(mut self, setup: SetupConfig) -> Self {
        self.setup = setup;
        self
    }

    /// Sets connection tuning.
    #[must_use]
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs connection tasks on `runtime` instead of the current one.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Serves peer requests with `handler`.
    #[must_use]
    pub fn handler<H: RequestHandler>(mut self, handler: H) -> Self {
        self.handler = HandlerSource::Handler(Arc::new(handler));
        self
    }

    /// Serves peer requests with a handler built from the socket itself, so
    /// the handler can issue requests back to the peer.
    #[must_use]
    pub fn handler_factory<F, H>(mut self, factory: F) -> Self
    where
        F: FnOnce(RSocket) -> H + Send + 'static,
        H: RequestHandler,
    {
        self.handler = HandlerSource::Factory(Box::new(move |socket| {
            Arc::new(factory(socket)) as Arc<dyn RequestHandler>
        }));
        self
    }

    pub(crate) const fn connection_config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn start(self, role: Role) -> Result<(RSocket, WriterQueues, SetupConfig)> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| Error::IllegalState(format!("no tokio runtime available: {e}")))?,
        };
        let (mux, outbound) = Multiplexer::new(role, self.config, runtime);
        let socket = RSocket { mux };
        socket.mux.set_handler(self.handler.build(socket.clone()));
        Ok((socket, outbound, self.setup))
    }

    /// Starts the client side of a connection over `io`.
    ///
    /// SETUP is queued before this returns, so requests may be issued right
    /// away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] when called outside a tokio runtime
    /// and no runtime was configured.
    pub fn connect<T>(self, io: T) -> Result<RSocket>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (socket, outbound, setup) = self.start(Role::Client)?;
        let mux = &socket.mux;
        let (reader, writer) = tokio::io::split(io);

        mux.spawn_writer(outbound, writer);
        mux.send(Frame::setup(setup.to_setup()));
        mux.spawn_reader(
            mux.framed_read(reader),
            Keepalive {
                interval: setup.keepalive_interval,
                max_lifetime: setup.max_lifetime,
                send: true,
            },
        );

        info!("Connected {} as client", socket.id());
        Ok(socket)
    }

    /// Starts the server side of a connection over `io`.
    ///
    /// Waits for the SETUP frame, validates it and offers it to the handler.
    ///
    /// # Errors
    ///
    /// Returns the protocol error sent to the peer when SETUP is missing,
    /// invalid or rejected, or [`Error::Timeout`] if it never arrives.
    pub async fn accept<T>(self, io: T) -> Result<RSocket>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (socket, outbound, _) = self.start(Role::Server)?;
        let mux = &socket.mux;
        let (reader, writer) = tokio::io::split(io);

        mux.spawn_writer(outbound, writer);
        let mut frames = mux.framed_read(reader);
        let setup = mux.handshake(&mut frames).await?;
        mux.spawn_reader(
            frames,
            Keepalive {
                interval: setup.keepalive_interval,
                max_lifetime: setup.max_lifetime,
                send: false,
            },
        );

        info!("Accepted {} as server", socket.id());
        Ok(socket)
    }
}

impl fmt::Debug for RSocketBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RSocketBuilder")
            .field("setup", &self.setup)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tracing::Instrument;
    use tracing_test::traced_test;

    struct Failing;

    #[async_trait]
    impl RequestHandler for Failing {
        async fn fire_and_forget(&self, _payload: Payload) -> Result<()> {
            Err(Error::application("nobody listening"))
        }
    }

    async fn pair(server: RSocketBuilder) -> (RSocket, RSocket) {
        let (client_io, server_io) = tokio::io::duplex(8 * 1024);
        // Keep the test span so connection logs are attributed to the test.
        let accept = tokio::spawn(server.accept(server_io).in_current_span());
        let client = RSocket::builder().connect(client_io).unwrap();
        let server = timeout(Duration::from_secs(5), accept)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        (client, server)
    }

    #[traced_test]
    #[tokio::test]
    async fn test_fire_and_forget_failure_is_logged() {
        let (client, server) = pair(RSocket::builder().handler(Failing)).await;

        client.fire_and_forget(Payload::from("ping")).unwrap();
        timeout(Duration::from_secs(5), async {
            while !logs_contain("fire-and-forget handler failed") {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("failure was never logged");

        assert!(!server.is_closed());
        assert!(!client.is_closed());
    }

    #[traced_test]
    #[tokio::test]
    async fn test_roles_and_close() {
        let (client, server) = pair(RSocket::builder()).await;
        assert_eq!(client.role(), Role::Client);
        assert_eq!(server.role(), Role::Server);
        assert_ne!(client.id(), server.id());

        server.close();
        timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap()
            .unwrap();
        assert!(client.is_closed());
        assert!(logs_contain("Connection closed"));
    }

    #[tokio::test]
    async fn test_connect_on_explicit_runtime() {
        let (io, _peer) = tokio::io::duplex(1024);
        let socket = RSocket::builder()
            .runtime(Handle::current())
            .connect(io)
            .unwrap();
        assert!(!socket.is_closed());
        assert_eq!(socket.active_streams(), 0);
    }
}
