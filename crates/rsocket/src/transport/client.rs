//! TCP client connector.

use crate::error::{Error, Result};
use crate::socket::{RSocket, RSocketBuilder};

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, instrument};

impl RSocketBuilder {
    /// Connects to `addr` over TCP and starts the client side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the connect takes longer than the
    /// configured connect timeout, or the underlying I/O error.
    #[instrument(skip(self, addr))]
    pub async fn connect_tcp<A: ToSocketAddrs>(self, addr: A) -> Result<RSocket> {
        let connect_timeout = self.connection_config().connect_timeout;
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!("TCP connection established to {:?}", stream.peer_addr().ok());

        self.connect(stream)
    }
}
