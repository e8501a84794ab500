//! End-to-end tests for the four interaction models over an in-memory pipe.

mod common;

use async_trait::async_trait;
use common::{WAIT, assert_quiet, eventually, next_text, pair};
use futures::{StreamExt, stream};
use proven_rsocket::{
    ConnectionConfig, Error, Payload, PayloadStream, Producer, ProtocolError, RSocket,
    RequestHandler, Result,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing_test::traced_test;

fn text(payload: &Payload) -> String {
    payload.data_utf8().unwrap_or_default().to_string()
}

/// Echoes requests and streams numbered items.
struct EchoHandler {
    produced: Arc<AtomicUsize>,
}

impl EchoHandler {
    fn new() -> Self {
        Self {
            produced: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn request_response(&self, payload: Payload) -> Result<Payload> {
        Ok(payload)
    }

    async fn request_stream(&self, payload: Payload) -> Result<Producer> {
        let count: usize = payload
            .data_utf8()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8);
        let produced = Arc::clone(&self.produced);
        Ok(stream::iter(0..count)
            .map(move |i| {
                produced.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::new(format!("data-{i}"), "meta"))
            })
            .boxed())
    }

    async fn request_channel(&self, inbound: PayloadStream) -> Result<Producer> {
        Ok(inbound
            .map(|item| item.map(|payload| Payload::from(format!("echo: {}", text(&payload)))))
            .boxed())
    }
}

#[traced_test]
#[tokio::test]
async fn test_request_response_roundtrip() {
    let (client, server) = pair(
        RSocket::builder(),
        RSocket::builder().handler(EchoHandler::new()),
    )
    .await;

    let response = timeout(WAIT, client.request_response(Payload::new("hello", "md")))
        .await
        .expect("Timed out")
        .expect("Request failed");

    assert_eq!(response, Payload::new("hello", "md"));
    eventually(|| client.active_streams() == 0 && server.active_streams() == 0).await;
}

#[traced_test]
#[tokio::test]
async fn test_sequential_requests_are_paired() {
    struct Prefixing;

    #[async_trait]
    impl RequestHandler for Prefixing {
        async fn request_response(&self, payload: Payload) -> Result<Payload> {
            let metadata = payload
                .metadata()
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .unwrap_or_default();
            Ok(Payload::new(
                format!("data: {}", text(&payload)),
                format!("meta: {metadata}"),
            ))
        }
    }

    let (client, _server) = pair(RSocket::builder(), RSocket::builder().handler(Prefixing)).await;

    for _ in 0..2 {
        let response = timeout(WAIT, client.request_response(Payload::new("dog", "cat")))
            .await
            .expect("Timed out")
            .expect("Request failed");
        assert_eq!(response.data_utf8(), Some("data: dog"));
        assert_eq!(response.metadata().map(|m| &m[..]), Some(&b"meta: cat"[..]));
    }
}

#[traced_test]
#[tokio::test]
async fn test_default_handler_rejects_requests() {
    let (client, _server) = pair(RSocket::builder(), RSocket::builder()).await;

    let err = timeout(WAIT, client.request_response(Payload::from("anyone?")))
        .await
        .expect("Timed out")
        .unwrap_err();

    assert!(matches!(err, Error::Protocol(ProtocolError::Rejected(_))));

    let mut stream = client.request_stream(Payload::from("anyone?"));
    let err = timeout(WAIT, stream.next())
        .await
        .expect("Timed out")
        .expect("Stream ended without error")
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::Rejected(_))));
}

#[traced_test]
#[tokio::test]
async fn test_handler_error_reaches_requester() {
    struct Failing;

    #[async_trait]
    impl RequestHandler for Failing {
        async fn request_response(&self, _payload: Payload) -> Result<Payload> {
            Err(Error::application("boom"))
        }
    }

    let (client, server) = pair(RSocket::builder(), RSocket::builder().handler(Failing)).await;

    let err = timeout(WAIT, client.request_response(Payload::from("x")))
        .await
        .expect("Timed out")
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::Application(ref message)) if message == "boom"
    ));
    eventually(|| client.active_streams() == 0 && server.active_streams() == 0).await;
}

#[traced_test]
#[tokio::test]
async fn test_handler_panic_becomes_application_error() {
    struct Panicking;

    #[async_trait]
    impl RequestHandler for Panicking {
        async fn request_response(&self, _payload: Payload) -> Result<Payload> {
            panic!("handler exploded");
        }
    }

    let (client, server) = pair(RSocket::builder(), RSocket::builder().handler(Panicking)).await;

    let err = timeout(WAIT, client.request_response(Payload::from("x")))
        .await
        .expect("Timed out")
        .unwrap_err();

    match err {
        Error::Protocol(ProtocolError::Application(message)) => {
            assert!(message.contains("handler exploded"), "got {message}");
        }
        other => panic!("Unexpected error: {other:?}"),
    }
    assert!(!server.is_closed(), "a handler panic must not close the connection");
}

#[traced_test]
#[tokio::test]
async fn test_fire_and_forget_delivers_payload() {
    struct Collector(mpsc::UnboundedSender<Payload>);

    #[async_trait]
    impl RequestHandler for Collector {
        async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
            self.0.send(payload).map_err(|_| Error::ConnectionClosed)
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (client, server) =
        pair(RSocket::builder(), RSocket::builder().handler(Collector(tx))).await;

    client
        .fire_and_forget(Payload::new("event", "topic"))
        .expect("Failed to send");

    let received = timeout(WAIT, rx.recv())
        .await
        .expect("Timed out")
        .expect("Collector dropped");
    assert_eq!(received, Payload::new("event", "topic"));
    assert_eq!(client.active_streams(), 0);
    assert_eq!(server.active_streams(), 0);
}

#[traced_test]
#[tokio::test]
async fn test_request_stream_honors_credit() {
    let handler = EchoHandler::new();
    let produced = Arc::clone(&handler.produced);
    let (client, server) = pair(RSocket::builder(), RSocket::builder().handler(handler)).await;

    let mut stream = client.request_stream_with(Payload::from("8"), 3);
    for i in 0..3 {
        assert_eq!(next_text(&mut stream).await, format!("data-{i}"));
    }
    assert_quiet(&mut stream).await;

    stream.request(2);
    for i in 3..5 {
        assert_eq!(next_text(&mut stream).await, format!("data-{i}"));
    }
    assert_quiet(&mut stream).await;

    stream.cancel();
    assert!(stream.next().await.is_none());

    eventually(|| server.active_streams() == 0 && client.active_streams() == 0).await;
    assert!(
        produced.load(Ordering::SeqCst) <= 6,
        "producer ran ahead of demand"
    );
}

#[traced_test]
#[tokio::test]
async fn test_request_stream_completes() {
    let (client, server) = pair(
        RSocket::builder(),
        RSocket::builder().handler(EchoHandler::new()),
    )
    .await;

    let items: Vec<String> = client
        .request_stream(Payload::from("4"))
        .map(|item| text(&item.expect("Stream failed")))
        .collect()
        .await;

    assert_eq!(items, ["data-0", "data-1", "data-2", "data-3"]);
    eventually(|| server.active_streams() == 0 && client.active_streams() == 0).await;
}

#[traced_test]
#[tokio::test]
async fn test_request_stream_error_mid_stream() {
    struct Faulty;

    #[async_trait]
    impl RequestHandler for Faulty {
        async fn request_stream(&self, _payload: Payload) -> Result<Producer> {
            Ok(stream::iter(vec![
                Ok(Payload::from("one")),
                Ok(Payload::from("two")),
                Err(Error::application("disk full")),
            ])
            .boxed())
        }
    }

    let (client, _server) = pair(RSocket::builder(), RSocket::builder().handler(Faulty)).await;
    let mut stream = client.request_stream(Payload::empty());

    assert_eq!(next_text(&mut stream).await, "one");
    assert_eq!(next_text(&mut stream).await, "two");
    let err = stream
        .next()
        .await
        .expect("Stream ended without error")
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::Application(ref message)) if message == "disk full"
    ));
    assert!(stream.next().await.is_none());
}

#[traced_test]
#[tokio::test]
async fn test_dropping_stream_cancels_producer() {
    struct Endless;

    #[async_trait]
    impl RequestHandler for Endless {
        async fn request_stream(&self, _payload: Payload) -> Result<Producer> {
            Ok(stream::repeat_with(|| Ok(Payload::from("tick"))).boxed())
        }
    }

    let (client, server) = pair(RSocket::builder(), RSocket::builder().handler(Endless)).await;

    let mut stream = client.request_stream_with(Payload::empty(), 2);
    next_text(&mut stream).await;
    eventually(|| server.active_streams() == 1).await;

    drop(stream);
    eventually(|| server.active_streams() == 0 && client.active_streams() == 0).await;
}

#[traced_test]
#[tokio::test]
async fn test_request_channel_echo() {
    let (client, server) = pair(
        RSocket::builder(),
        RSocket::builder().handler(EchoHandler::new()),
    )
    .await;

    let outbound = stream::iter(["a", "b", "c"].map(|s| Ok(Payload::from(s))));
    let replies: Vec<String> = client
        .request_channel(outbound)
        .map(|item| text(&item.expect("Channel failed")))
        .collect()
        .await;

    assert_eq!(replies, ["echo: a", "echo: b", "echo: c"]);
    eventually(|| server.active_streams() == 0 && client.active_streams() == 0).await;
}

#[traced_test]
#[tokio::test]
async fn test_empty_channel_completes_immediately() {
    struct Tally;

    #[async_trait]
    impl RequestHandler for Tally {
        async fn request_channel(&self, inbound: PayloadStream) -> Result<Producer> {
            Ok(stream::once(async move {
                let seen = inbound.count().await;
                Ok(Payload::from(format!("seen {seen}")))
            })
            .boxed())
        }
    }

    let (client, _server) = pair(RSocket::builder(), RSocket::builder().handler(Tally)).await;

    // The responder's inbound ends without yielding anything.
    let mut replies = client.request_channel(stream::empty());
    assert_eq!(next_text(&mut replies).await, "seen 0");
    assert!(timeout(WAIT, replies.next()).await.expect("Timed out").is_none());
}

#[traced_test]
#[tokio::test]
async fn test_cancel_before_channel_opens_never_reaches_peer() {
    struct Counting {
        opened: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RequestHandler for Counting {
        async fn request_channel(&self, _inbound: PayloadStream) -> Result<Producer> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(stream::empty().boxed())
        }
    }

    let opened = Arc::new(AtomicUsize::new(0));
    let (client, server) = pair(
        RSocket::builder(),
        RSocket::builder().handler(Counting {
            opened: Arc::clone(&opened),
        }),
    )
    .await;

    // The outbound never yields its first payload, so nothing is sent yet.
    let replies = client.request_channel(stream::pending::<Result<Payload>>());
    eventually(|| client.active_streams() == 1).await;
    drop(replies);

    eventually(|| client.active_streams() == 0).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(opened.load(Ordering::SeqCst), 0);
    assert_eq!(server.active_streams(), 0);
    assert!(!client.is_closed() && !server.is_closed());
}

#[traced_test]
#[tokio::test(flavor = "current_thread")]
async fn test_endless_stream_with_unbounded_credit_stays_cancelable() {
    struct Endless;

    #[async_trait]
    impl RequestHandler for Endless {
        async fn request_stream(&self, _payload: Payload) -> Result<Producer> {
            Ok(stream::repeat_with(|| Ok(Payload::from("tick"))).boxed())
        }
    }

    let (client, server) = pair(RSocket::builder(), RSocket::builder().handler(Endless)).await;

    let mut ticks = client.request_stream(Payload::empty());
    for _ in 0..3 {
        assert_eq!(next_text(&mut ticks).await, "tick");
    }
    drop(ticks);

    eventually(|| client.active_streams() == 0 && server.active_streams() == 0).await;
    let response = timeout(WAIT, client.request_response(Payload::from("ping"))).await;
    assert!(response.is_ok(), "connection stopped making progress");
}

#[traced_test]
#[tokio::test]
async fn test_channel_responder_paces_requester() {
    struct Pacing {
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl RequestHandler for Pacing {
        async fn request_channel(&self, inbound: PayloadStream) -> Result<Producer> {
            let seen = self.seen.clone();
            Ok(stream::unfold(inbound, move |mut inbound| {
                let seen = seen.clone();
                async move {
                    let item = inbound.next().await?;
                    if let Ok(payload) = &item {
                        let _ = seen.send(text(payload));
                    }
                    inbound.request(1);
                    Some((item, inbound))
                }
            })
            .boxed())
        }
    }

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let server_config = ConnectionConfig {
        inbound_request_n: 1,
        ..ConnectionConfig::default()
    };
    let (client, _server) = pair(
        RSocket::builder(),
        RSocket::builder()
            .config(server_config)
            .handler(Pacing { seen: seen_tx }),
    )
    .await;

    let outbound = stream::iter((0..5).map(|i| Ok(Payload::from(format!("m{i}")))));
    let replies: Vec<String> = client
        .request_channel(outbound)
        .map(|item| text(&item.expect("Channel failed")))
        .collect()
        .await;

    assert_eq!(replies, ["m0", "m1", "m2", "m3", "m4"]);
    let mut seen = Vec::new();
    while let Ok(item) = seen_rx.try_recv() {
        seen.push(item);
    }
    assert_eq!(seen, ["m0", "m1", "m2", "m3", "m4"]);
}

#[traced_test]
#[tokio::test]
async fn test_server_can_call_back_into_client() {
    struct ClientSide;

    #[async_trait]
    impl RequestHandler for ClientSide {
        async fn request_response(&self, payload: Payload) -> Result<Payload> {
            Ok(Payload::from(format!("(client {})", text(&payload))))
        }
    }

    struct ServerSide {
        socket: RSocket,
    }

    #[async_trait]
    impl RequestHandler for ServerSide {
        async fn request_response(&self, payload: Payload) -> Result<Payload> {
            let reply = self.socket.request_response(payload).await?;
            Ok(Payload::from(format!("(server {})", text(&reply))))
        }
    }

    let (client, _server) = pair(
        RSocket::builder().handler(ClientSide),
        RSocket::builder().handler_factory(|socket| ServerSide { socket }),
    )
    .await;

    let response = timeout(WAIT, client.request_response(Payload::from("data")))
        .await
        .expect("Timed out")
        .expect("Request failed");

    assert_eq!(text(&response), "(server (client data))");
}

#[traced_test]
#[tokio::test]
async fn test_cancel_pending_response() {
    struct SignalOnDrop(Option<oneshot::Sender<()>>);

    impl Drop for SignalOnDrop {
        fn drop(&mut self) {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(());
            }
        }
    }

    struct Stalled {
        started: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
        dropped: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    }

    #[async_trait]
    impl RequestHandler for Stalled {
        async fn request_response(&self, _payload: Payload) -> Result<Payload> {
            let _guard = SignalOnDrop(self.dropped.lock().take());
            if let Some(started) = self.started.lock().take() {
                let _ = started.send(());
            }
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    let (started_tx, started_rx) = oneshot::channel();
    let (dropped_tx, dropped_rx) = oneshot::channel();
    let handler = Stalled {
        started: parking_lot::Mutex::new(Some(started_tx)),
        dropped: parking_lot::Mutex::new(Some(dropped_tx)),
    };
    let (client, server) = pair(RSocket::builder(), RSocket::builder().handler(handler)).await;

    let mut pending = client.request_response(Payload::from("slow"));
    timeout(WAIT, started_rx)
        .await
        .expect("Handler never started")
        .expect("Handler dropped signal");

    pending.cancel();
    let err = pending.await.unwrap_err();
    assert!(err.is_canceled());

    timeout(WAIT, dropped_rx)
        .await
        .expect("Handler future was not dropped")
        .expect("Drop signal lost");
    eventually(|| server.active_streams() == 0 && client.active_streams() == 0).await;
}

#[traced_test]
#[tokio::test]
async fn test_close_fails_live_streams() {
    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn request_stream(&self, _payload: Payload) -> Result<Producer> {
            Ok(stream::pending().boxed())
        }
    }

    let (client, server) = pair(RSocket::builder(), RSocket::builder().handler(Silent)).await;

    let mut stream = client.request_stream(Payload::empty());
    eventually(|| server.active_streams() == 1).await;

    client.close();
    let err = timeout(WAIT, stream.next())
        .await
        .expect("Timed out")
        .expect("Stream ended without error")
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    assert!(stream.next().await.is_none());

    timeout(WAIT, client.closed())
        .await
        .expect("Client never closed")
        .expect("Client closed with error");
    timeout(WAIT, server.closed())
        .await
        .expect("Server never noticed the close")
        .expect("Server closed with error");
    assert_eq!(server.active_streams(), 0);

    let err = client
        .request_response(Payload::from("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    assert!(client.fire_and_forget(Payload::from("late")).is_err());
}
