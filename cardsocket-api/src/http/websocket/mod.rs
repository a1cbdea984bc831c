//! WebSocket upgrade handler and receive loop.
//!
//! The client identity comes from a request header (`X-User-Id` by default)
//! and is trusted as supplied. After the upgrade the connection is registered
//! under that identity, displacing any previous connection for it, and every
//! text or binary frame it sends is handed to the relay.

pub mod connection;
pub mod session;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::stream::{SplitStream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use cardsocket_cluster::{Connection, ConnectionRef, Error as RelayError, Payload};
use cardsocket_core::ClientId;

use crate::http::{AppError, AppResult, AppState};

pub use connection::WsConnection;
pub use session::{CloseReason, ConnectionState, Session};

/// Upgrade `GET {ws_path}` to a relay connection
pub async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<impl IntoResponse> {
    let header = state.settings.identity_header.as_str();
    let raw = headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let client_id = ClientId::parse(raw)
        .map_err(|_| AppError::bad_request(format!("Missing {header} header")))?;

    if state.shutdown.is_cancelled() {
        return Err(AppError::service_unavailable("Server is shutting down"));
    }
    if !state.relay.is_running() {
        return Err(RelayError::QueueClosed.into());
    }

    let ws = ws.map_err(|rejection| {
        debug!(client_id = %client_id, error = %rejection, "WebSocket upgrade rejected");
        AppError::new(rejection.status(), rejection.body_text())
    })?;

    let failed_client = client_id.clone();
    Ok(ws
        .max_message_size(state.settings.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(client_id = %failed_client, error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_socket(socket, state, client_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: ClientId) {
    let (sink, mut stream) = socket.split();
    let (connection, writer) = WsConnection::spawn(sink, state.settings.connection_buffer);
    let connection_ref: ConnectionRef = connection.clone();
    let mut session = Session::new(client_id.clone(), connection.id().clone());

    let registry = state.relay.registry();
    if let Some(displaced) = registry.register(client_id.clone(), connection_ref.clone()).await {
        info!(
            client_id = %client_id,
            connection_id = %displaced.id(),
            "Closing connection displaced by reconnect"
        );
        displaced.close();
    }
    session.open();

    let reason = receive_loop(&mut stream, &state, &client_id, &connection).await;
    session.begin_closing(&reason);

    registry.unregister_connection(&client_id, &connection_ref).await;
    if let Err(e) = writer.await {
        warn!(client_id = %client_id, error = %e, "WebSocket writer task failed");
    }

    session.finish();
}

/// Read frames until the connection ends. Inbound frames are never answered
/// directly; they only reach clients through the relay.
async fn receive_loop(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    client_id: &ClientId,
    connection: &Arc<WsConnection>,
) -> CloseReason {
    loop {
        let message = tokio::select! {
            () = connection.closed() => return CloseReason::ClosedByServer,
            () = state.shutdown.cancelled() => return CloseReason::Shutdown,
            message = stream.next() => message,
        };

        let payload = match message {
            Some(Ok(Message::Text(text))) => Payload::text(text.as_str()),
            Some(Ok(Message::Binary(data))) => Payload::binary(data),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) => return CloseReason::PeerClosed,
            Some(Err(e)) => return CloseReason::ReadError(e.to_string()),
            None => return CloseReason::EndOfStream,
        };

        // Dropped payloads are logged by the relay; the connection stays up
        let _ = state.relay.handle_inbound(client_id, payload);
    }
}
