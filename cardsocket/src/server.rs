//! Server lifecycle management
//!
//! Binds the HTTP listener, serves the upgrade endpoint until a shutdown
//! signal arrives, then lets connections drain before stopping the relay.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cardsocket_api::{create_router, AppState, WsSettings};
use cardsocket_cluster::Relay;
use cardsocket_core::Config;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct CardSocketServer {
    config: Config,
    relay: Arc<Relay>,
    shutdown_token: CancellationToken,
}

impl CardSocketServer {
    pub fn new(config: Config, relay: Arc<Relay>) -> Self {
        Self {
            config,
            relay,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Start serving and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting cardsocket server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut http_handle = self.start_http_server(shutdown_rx).await?;

        let stopped_unexpectedly = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                true
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                false
            }
        };

        // Receive loops end on this token; the listener stops on the watch
        self.shutdown_token.cancel();
        let _ = shutdown_tx.send(true);

        self.shutdown().await;

        if stopped_unexpectedly {
            anyhow::bail!("HTTP server stopped unexpectedly");
        }
        Ok(())
    }

    async fn start_http_server(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .with_context(|| format!("Invalid HTTP address '{http_address}'"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP address {http_addr}"))?;

        let state = AppState::new(
            self.relay.clone(),
            WsSettings::from_config(&self.config),
            self.shutdown_token.clone(),
        );
        let router = create_router(state);

        info!(
            "HTTP server listening on {} (upgrade path {})",
            http_addr, self.config.server.ws_path
        );

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }

    async fn shutdown(&self) {
        info!("Shutting down cardsocket server...");

        let registry = self.relay.registry();
        let drain_timeout = Duration::from_secs(self.config.server.shutdown_drain_seconds);
        let active = registry.len();
        if active > 0 {
            info!(
                "Waiting up to {}s for {} active connection(s) to drain...",
                drain_timeout.as_secs(),
                active
            );
            let deadline = tokio::time::Instant::now() + drain_timeout;
            loop {
                let remaining = registry.len();
                if remaining == 0 {
                    info!("All connections drained");
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        "Drain timeout reached with {} connection(s) still active, closing them",
                        remaining
                    );
                    break;
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        }

        self.relay.shutdown().await;

        let registry_metrics = registry.metrics();
        let bridge_metrics = self.relay.bridge().metrics();
        info!(
            total_registered = registry_metrics.total_registered,
            delivered = registry_metrics.delivered,
            failed_writes = registry_metrics.failed_writes,
            published = bridge_metrics.published,
            publish_failures = bridge_metrics.publish_failures,
            "Relay statistics"
        );

        info!("cardsocket server shut down complete");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
