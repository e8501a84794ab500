//! Echo server.
//!
//! Answers request-response with the request payload, streams the request
//! text back word by word, and echoes every channel message.

use async_trait::async_trait;
use clap::Parser;
use futures::{StreamExt, stream};
use proven_rsocket::{
    Payload, PayloadStream, Producer, RSocket, RSocketServer, RequestHandler, Result,
    ServerConfig,
};
use std::net::SocketAddr;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "RSocket echo server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    addr: SocketAddr,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

struct EchoHandler {
    peer: RSocket,
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        info!(
            "[{}] fire-and-forget: {:?}",
            self.peer.id(),
            payload.data_utf8()
        );
        Ok(())
    }

    async fn request_response(&self, payload: Payload) -> Result<Payload> {
        Ok(payload)
    }

    async fn request_stream(&self, payload: Payload) -> Result<Producer> {
        let words: Vec<Result<Payload>> = payload
            .data_utf8()
            .unwrap_or_default()
            .split_whitespace()
            .map(|word| Ok(Payload::from(word.to_string())))
            .collect();
        Ok(stream::iter(words).boxed())
    }

    async fn request_channel(&self, inbound: PayloadStream) -> Result<Producer> {
        Ok(inbound.boxed())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let config = ServerConfig {
        max_connections: args.max_connections,
        ..ServerConfig::default()
    };
    let server = RSocketServer::bind(args.addr, |peer| EchoHandler { peer }, config).await?;
    info!("Echo server listening on {}", server.local_addr()?);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    if let Err(e) = server.serve().await {
        error!("Echo server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
