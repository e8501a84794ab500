//! Echo client.
//!
//! Exercises every interaction model against `echo_server`.

use clap::Parser;
use futures::{StreamExt, stream};
use proven_rsocket::{Payload, RSocket, SetupConfig};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "RSocket echo client", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    addr: String,

    /// Message to send
    #[arg(short, long, default_value = "hello from rsocket")]
    message: String,

    /// Keep-alive interval in seconds
    #[arg(long, default_value_t = 20)]
    keepalive: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
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

    let setup = SetupConfig::default().with_keepalive(
        Duration::from_secs(args.keepalive),
        Duration::from_secs(args.keepalive * 3),
    );
    let socket = RSocket::builder()
        .setup(setup)
        .connect_tcp(args.addr.as_str())
        .await?;

    socket.fire_and_forget(Payload::from(args.message.clone()))?;

    let response = socket
        .request_response(Payload::from(args.message.clone()))
        .await?;
    info!("request-response: {:?}", response.data_utf8());

    // Pull the words one at a time.
    let mut words = socket.request_stream_with(Payload::from(args.message.clone()), 1);
    while let Some(word) = words.next().await {
        info!("request-stream: {:?}", word?.data_utf8());
        words.request(1);
    }

    let outbound = stream::iter(
        args.message
            .split_whitespace()
            .map(|word| Ok(Payload::from(word.to_uppercase())))
            .collect::<Vec<_>>(),
    );
    let mut replies = socket.request_channel(outbound);
    while let Some(reply) = replies.next().await {
        info!("request-channel: {:?}", reply?.data_utf8());
    }

    socket.close();
    socket.closed().await?;
    Ok(())
}
