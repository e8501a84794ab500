//! Shared helpers for integration tests.

#![allow(dead_code)]

use futures::StreamExt;
use proven_rsocket::{PayloadStream, RSocket, RSocketBuilder};
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Generous bound for anything that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(5);

/// Connects a client and a server over an in-memory pipe.
pub async fn pair(client: RSocketBuilder, server: RSocketBuilder) -> (RSocket, RSocket) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let accept = tokio::spawn(server.accept(server_io));
    let client = client.connect(client_io).expect("Failed to start client");
    let server = timeout(WAIT, accept)
        .await
        .expect("Timed out waiting for SETUP")
        .expect("Accept task panicked")
        .expect("Failed to accept connection");
    (client, server)
}

/// Polls `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

/// Next payload's data as text.
pub async fn next_text(stream: &mut PayloadStream) -> String {
    let payload = timeout(WAIT, stream.next())
        .await
        .expect("Timed out waiting for payload")
        .expect("Stream ended early")
        .expect("Stream failed");
    payload.data_utf8().unwrap_or_default().to_string()
}

/// Asserts nothing arrives on `stream` for a short while.
pub async fn assert_quiet(stream: &mut PayloadStream) {
    assert!(
        timeout(Duration::from_millis(100), stream.next())
            .await
            .is_err(),
        "Received a payload that was never requested"
    );
}
