// Module: http
// WebSocket upgrade endpoint for the relay

pub mod error;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cardsocket_cluster::Relay;
use cardsocket_core::Config;

pub use error::{AppError, AppResult};

/// Per-connection settings taken from configuration
#[derive(Debug, Clone)]
pub struct WsSettings {
    pub path: String,
    pub identity_header: String,
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before writes start to wait
    pub connection_buffer: usize,
}

impl WsSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.server.ws_path.clone(),
            identity_header: config.server.identity_header.clone(),
            max_message_size: config.server.max_message_size,
            connection_buffer: config.relay.connection_buffer,
        }
    }
}

impl Default for WsSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub settings: Arc<WsSettings>,
    /// Cancelled when the server starts shutting down
    pub shutdown: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn new(relay: Arc<Relay>, settings: WsSettings, shutdown: CancellationToken) -> Self {
        Self {
            relay,
            settings: Arc::new(settings),
            shutdown,
        }
    }
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    let path = state.settings.path.clone();

    Router::new()
        .route(&path, get(websocket::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
