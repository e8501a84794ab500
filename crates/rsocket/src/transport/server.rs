//! TCP server accepting RSocket connections.

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::handler::RequestHandler;
use crate::socket::RSocket;

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the RSocket server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Tuning applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Server that accepts TCP connections and serves each with its own handler.
///
/// The factory runs once per connection with that connection's socket, so
/// handlers can issue requests back to the client.
pub struct RSocketServer<F> {
    listener: TcpListener,
    factory: Arc<F>,
    config: ServerConfig,
    shutdown: CancellationToken,
    connections: Arc<DashMap<Uuid, RSocket>>,
}

impl<F, H> RSocketServer<F>
where
    F: Fn(RSocket) -> H + Send + Sync + 'static,
    H: RequestHandler,
{
    /// Binds a server to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, factory: F, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("Failed to bind to {addr}: {e}"))
        })?;

        Ok(Self {
            listener,
            factory: Arc::new(factory),
            config,
            shutdown: CancellationToken::new(),
            connections: Arc::new(DashMap::new()),
        })
    }

    /// The address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the server when canceled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of connections currently established.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accepts connections until the shutdown token is canceled, then closes
    /// every established connection.
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and skipped.
    #[instrument(skip(self))]
    pub async fn serve(self) -> Result<()> {
        info!("RSocket server listening on {:?}", self.listener.local_addr().ok());

        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => match Arc::clone(&semaphore).try_acquire_owned() {
                            Ok(permit) => {
                                let factory = Arc::clone(&self.factory);
                                let config = self.config.connection.clone();
                                let connections = Arc::clone(&self.connections);
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        Self::handle_connection(stream, addr, factory, config, connections).await
                                    {
                                        error!("Connection error from {}: {}", addr, e);
                                    }
                                    drop(permit);
                                });
                            }
                            Err(_) => {
                                warn!("Max connections reached, rejecting connection from {}", addr);
                            }
                        },
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                () = self.shutdown.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }
            }
        }

        for entry in self.connections.iter() {
            entry.value().close();
        }
        Ok(())
    }

    #[instrument(skip(stream, factory, config, connections))]
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        factory: Arc<F>,
        config: ConnectionConfig,
        connections: Arc<DashMap<Uuid, RSocket>>,
    ) -> Result<()> {
        debug!("New connection from {}", addr);
        stream.set_nodelay(true)?;

        let socket = RSocket::builder()
            .config(config)
            .handler_factory(move |socket| (*factory)(socket))
            .accept(stream)
            .await?;

        let id = socket.id();
        connections.insert(id, socket.clone());
        let result = socket.closed().await;
        connections.remove(&id);

        debug!("Connection from {} closed", addr);
        result
    }
}
