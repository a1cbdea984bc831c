//! End-to-end relay behaviour over real WebSocket connections.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use cardsocket_api::{create_router, AppState, WsSettings};
use cardsocket_cluster::{MemoryBroker, MessageEnvelope, Relay, RelayOptions};
use cardsocket_core::{ClientId, DeliveryMode};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    relay: Arc<Relay>,
    broker: Arc<MemoryBroker>,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start(delivery_mode: DeliveryMode) -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let relay = Relay::start(
            broker.clone(),
            RelayOptions {
                delivery_mode,
                write_timeout: Duration::from_millis(500),
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                ..RelayOptions::new("test-node")
            },
        );
        eventually("relay subscription", || relay.bridge().is_subscribed()).await;

        let shutdown = CancellationToken::new();
        let state = AppState::new(relay.clone(), WsSettings::default(), shutdown.clone());
        let router = create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            addr,
            relay,
            broker,
            shutdown,
        }
    }

    async fn connect(&self, user: &str) -> Client {
        let expected = self.relay.registry().metrics().total_registered + 1;
        let mut request = format!("ws://{}/ws", self.addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("x-user-id", user.parse().unwrap());
        let (client, _) = connect_async(request).await.unwrap();

        // Registration happens after the handshake completes
        eventually("registration", || {
            self.relay.registry().metrics().total_registered >= expected
        })
        .await;
        client
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Next data frame, skipping control frames
async fn recv(client: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(message)) => return message,
                other => panic!("connection ended unexpectedly: {other:?}"),
            }
        }
    })
    .await
    .expect("no frame received")
}

/// Assert nothing else arrives within a short window
async fn assert_silent(client: &mut Client) {
    let next = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

/// Wait for the server to close the connection
async fn expect_closed(client: &mut Client) {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("connection was not closed");
}

#[tokio::test]
async fn test_two_clients_each_receive_one_copy() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    alice.send(Message::text("hello")).await.unwrap();

    // The sender is a recipient too
    assert_eq!(recv(&mut alice).await, Message::text("hello"));
    assert_eq!(recv(&mut bob).await, Message::text("hello"));
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_binary_frames_stay_binary() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    alice
        .send(Message::binary(vec![0u8, 1, 2, 255]))
        .await
        .unwrap();

    assert_eq!(recv(&mut bob).await, Message::binary(vec![0u8, 1, 2, 255]));
    assert_eq!(recv(&mut alice).await, Message::binary(vec![0u8, 1, 2, 255]));
}

#[tokio::test]
async fn test_abrupt_disconnect_does_not_block_others() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    let carol = server.connect("carol").await;
    assert_eq!(server.relay.registry().len(), 3);

    // Drop the TCP connection without a close handshake
    drop(carol);

    alice.send(Message::text("still there?")).await.unwrap();

    assert_eq!(recv(&mut alice).await, Message::text("still there?"));
    assert_eq!(recv(&mut bob).await, Message::text("still there?"));
    eventually("carol removed", || server.relay.registry().len() == 2).await;
    assert!(!server.relay.registry().contains(&ClientId::from("carol")).await);
}

#[tokio::test]
async fn test_reconnect_displaces_previous_connection() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;
    let mut first = server.connect("alice").await;
    let mut second = server.connect("alice").await;

    expect_closed(&mut first).await;
    assert_eq!(server.relay.registry().len(), 1);

    // The newer connection keeps working
    second.send(Message::text("new session")).await.unwrap();
    assert_eq!(recv(&mut second).await, Message::text("new session"));

    // The old connection's cleanup must not have removed the new one
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.relay.registry().contains(&ClientId::from("alice")).await);
    assert_eq!(server.relay.registry().metrics().replaced, 1);
}

#[tokio::test]
async fn test_local_first_delivers_exactly_once() {
    let server = TestServer::start(DeliveryMode::LocalFirst).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    alice.send(Message::text("once")).await.unwrap();

    assert_eq!(recv(&mut bob).await, Message::text("once"));
    assert_eq!(recv(&mut alice).await, Message::text("once"));
    eventually("echo dropped", || server.relay.bridge().metrics().dropped_own == 1).await;
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_envelope_is_broadcast_verbatim() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    let mut carol = server.connect("carol").await;

    let envelope = MessageEnvelope::new("bob", "alice", "for bob only?").to_json().unwrap();
    alice.send(Message::text(envelope.clone())).await.unwrap();

    // No per-recipient routing: everyone gets it
    assert_eq!(recv(&mut bob).await, Message::text(envelope.clone()));
    assert_eq!(recv(&mut carol).await, Message::text(envelope.clone()));
    assert_eq!(recv(&mut alice).await, Message::text(envelope));
}

#[tokio::test]
async fn test_broker_outage_keeps_connections_open() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    server.broker.disconnect();
    alice.send(Message::text("lost")).await.unwrap();
    eventually("publish failure", || {
        server.relay.bridge().metrics().publish_failures == 1
    })
    .await;
    assert_eq!(server.relay.registry().len(), 2);

    server.broker.reconnect();
    eventually("resubscribed", || server.relay.bridge().is_subscribed()).await;

    alice.send(Message::text("recovered")).await.unwrap();
    assert_eq!(recv(&mut bob).await, Message::text("recovered"));
}

#[tokio::test]
async fn test_missing_identity_is_rejected() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;

    let err = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap_err();

    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {other:?}"),
    }
    assert!(server.relay.registry().is_empty());
}

#[tokio::test]
async fn test_blank_identity_is_rejected() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;

    let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    request.headers_mut().insert("x-user-id", "   ".parse().unwrap());

    match connect_async(request).await.unwrap_err() {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;
    let mut alice = server.connect("alice").await;

    server.shutdown.cancel();
    server.relay.shutdown().await;

    expect_closed(&mut alice).await;
    assert!(server.relay.registry().is_empty());
}

#[tokio::test]
async fn test_upgrade_after_relay_stopped_is_unavailable() {
    let server = TestServer::start(DeliveryMode::BrokerEcho).await;
    server.relay.shutdown().await;

    let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    request.headers_mut().insert("x-user-id", "alice".parse().unwrap());

    match connect_async(request).await.unwrap_err() {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 503),
        other => panic!("expected HTTP 503, got {other:?}"),
    }
    assert!(server.relay.registry().is_empty());
}
