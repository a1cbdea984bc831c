//! Registry-facing handle for one WebSocket.
//!
//! Frames handed to `send` go through a bounded channel to a writer task
//! that owns the sink half of the socket. A full channel makes `send` wait,
//! which is what the registry's write deadline measures.

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cardsocket_cluster::{Connection, ConnectionId, Error, Payload, PayloadKind, Result};

/// Time allowed for the close frame to go out
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

pub struct WsConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl WsConnection {
    /// Start the writer task for `sink`
    pub fn spawn<S>(sink: S, buffer: usize) -> (Arc<Self>, JoinHandle<()>)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            tx,
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        });

        let writer = tokio::spawn(run_writer(
            sink,
            rx,
            connection.close_token.clone(),
            connection.id.clone(),
        ));

        (connection, writer)
    }

    /// Resolves once the connection is closed, from either side
    pub async fn closed(&self) {
        self.close_token.cancelled().await;
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, payload: Payload) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.tx
            .send(to_message(payload))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.close_token.cancel();
        first
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.close_token.is_cancelled()
    }
}

/// Text payloads that are not valid UTF-8 go out as binary frames
fn to_message(payload: Payload) -> Message {
    match payload.kind {
        PayloadKind::Binary => Message::Binary(payload.data),
        PayloadKind::Text => match String::from_utf8(payload.data.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(payload.data),
        },
    }
}

async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Message>,
    close_token: CancellationToken,
    connection_id: ConnectionId,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    loop {
        let message = tokio::select! {
            biased;
            () = close_token.cancelled() => break,
            message = rx.recv() => message,
        };

        let Some(message) = message else {
            break;
        };

        // A peer that stops reading can park the write forever
        let sent = tokio::select! {
            biased;
            () = close_token.cancelled() => {
                debug!(connection_id = %connection_id, "Closed while a write was pending, dropping sink");
                return;
            }
            sent = sink.send(message) => sent,
        };

        if let Err(e) = sent {
            warn!(
                connection_id = %connection_id,
                error = %e,
                "Failed to send WebSocket message"
            );
            close_token.cancel();
            return;
        }
    }

    // Best effort: the peer may already be gone
    if let Ok(Err(e)) = timeout(CLOSE_FRAME_TIMEOUT, async {
        sink.send(Message::Close(None)).await?;
        sink.close().await
    })
    .await
    {
        debug!(connection_id = %connection_id, error = %e, "Close frame not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_send_preserves_frame_kind() {
        let (sink, mut written) = fmpsc::channel::<Message>(16);
        let (conn, _writer) = WsConnection::spawn(sink, 8);

        conn.send(Payload::text("hello")).await.unwrap();
        conn.send(Payload::binary(vec![1, 2, 3])).await.unwrap();

        assert_eq!(written.next().await.unwrap(), Message::Text("hello".into()));
        assert_eq!(
            written.next().await.unwrap(),
            Message::Binary(vec![1, 2, 3].into())
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_text_goes_out_as_binary() {
        let (sink, mut written) = fmpsc::channel::<Message>(16);
        let (conn, _writer) = WsConnection::spawn(sink, 8);

        let payload = Payload {
            kind: PayloadKind::Text,
            data: vec![0xff, 0xfe].into(),
        };
        conn.send(payload).await.unwrap();

        assert_eq!(
            written.next().await.unwrap(),
            Message::Binary(vec![0xff, 0xfe].into())
        );
    }

    #[tokio::test]
    async fn test_close_sends_close_frame_once() {
        let (sink, mut written) = fmpsc::channel::<Message>(16);
        let (conn, writer) = WsConnection::spawn(sink, 8);

        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        writer.await.unwrap();

        assert_eq!(written.next().await.unwrap(), Message::Close(None));
        assert!(written.next().await.is_none());
        assert!(matches!(
            conn.send(Payload::text("late")).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_sink_failure_closes_connection() {
        let (sink, written) = fmpsc::channel::<Message>(16);
        drop(written);
        let (conn, writer) = WsConnection::spawn(sink, 8);

        conn.send(Payload::text("into the void")).await.unwrap();
        writer.await.unwrap();

        assert!(conn.is_closed());
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("closed() should resolve after a write failure");
    }

    #[tokio::test]
    async fn test_full_buffer_makes_send_wait() {
        // Nobody reads from the sink, so the writer stalls on the first frame
        let (sink, _unread) = fmpsc::channel::<Message>(0);
        let (conn, _writer) = WsConnection::spawn(sink, 1);

        let mut stalled = false;
        for i in 0..8 {
            let send = conn.send(Payload::text(format!("m{i}")));
            if timeout(Duration::from_millis(50), send).await.is_err() {
                stalled = true;
                break;
            }
        }
        assert!(stalled, "send should block once the buffer is full");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_releases_writer_stuck_on_sink() {
        let (sink, _unread) = fmpsc::channel::<Message>(0);
        let (conn, writer) = WsConnection::spawn(sink, 1);

        let mut stalled = false;
        for i in 0..8 {
            let send = conn.send(Payload::text(format!("m{i}")));
            if timeout(Duration::from_millis(50), send).await.is_err() {
                stalled = true;
                break;
            }
        }
        assert!(stalled);

        assert!(conn.close());
        timeout(Duration::from_secs(3), writer)
            .await
            .expect("writer should stop once the connection is closed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stalled_peer_is_dropped_from_broadcast() {
        use cardsocket_cluster::{ConnectionRef, ConnectionRegistry};
        use cardsocket_core::ClientId;

        let registry = ConnectionRegistry::new(Duration::from_millis(100));

        let (alice_sink, mut alice_out) = fmpsc::channel::<Message>(64);
        let (alice, _alice_writer) = WsConnection::spawn(alice_sink, 8);
        let (bob_sink, mut bob_out) = fmpsc::channel::<Message>(64);
        let (bob, _bob_writer) = WsConnection::spawn(bob_sink, 8);
        // Nobody reads carol's sink
        let (carol_sink, _carol_unread) = fmpsc::channel::<Message>(0);
        let (carol, carol_writer) = WsConnection::spawn(carol_sink, 1);

        let alice_ref: ConnectionRef = alice.clone();
        let bob_ref: ConnectionRef = bob.clone();
        let carol_ref: ConnectionRef = carol.clone();
        registry.register(ClientId::from("alice"), alice_ref).await;
        registry.register(ClientId::from("bob"), bob_ref).await;
        registry.register(ClientId::from("carol"), carol_ref).await;

        // Carol's sink and channel fill up partway through these passes
        let mut failed = 0;
        for i in 0..6 {
            failed += registry.broadcast(&Payload::text(format!("m{i}"))).await.failed;
        }
        assert_eq!(failed, 1);

        for i in 0..6 {
            let expected = Message::Text(format!("m{i}").into());
            assert_eq!(alice_out.next().await.unwrap(), expected);
            assert_eq!(bob_out.next().await.unwrap(), expected);
        }

        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(&ClientId::from("carol")).await);
        assert!(carol.is_closed());
        assert!(!alice.is_closed());
        timeout(Duration::from_secs(3), carol_writer)
            .await
            .expect("stalled writer should be released")
            .unwrap();
    }
}
