use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use cardsocket_core::ClientId;

use super::connection::{ConnectionRef, Payload};
use crate::error::Error;

/// Outcome of one fan-out pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Registry metrics
#[derive(Debug, Clone)]
pub struct RegistryMetrics {
    pub active_connections: usize,
    pub total_registered: u64,
    pub replaced: u64,
    pub delivered: u64,
    pub failed_writes: u64,
}

/// Who is currently reachable from this process.
///
/// Register/unregister take the write lock. A fan-out pass holds the read
/// lock for the whole iteration, so it excludes register/unregister but not
/// other passes. Connections whose write fails are removed only after the
/// read lock is released.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ClientId, ConnectionRef>>,
    write_timeout: Duration,

    active: AtomicUsize,
    total_registered: AtomicU64,
    replaced: AtomicU64,
    delivered: AtomicU64,
    failed_writes: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            write_timeout,
            active: AtomicUsize::new(0),
            total_registered: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
        }
    }

    /// Insert or replace the connection registered under `client_id`.
    ///
    /// Returns the displaced connection, if any. The registry no longer
    /// references it and does not close it; that is up to the caller.
    pub async fn register(&self, client_id: ClientId, connection: ConnectionRef) -> Option<ConnectionRef> {
        let connection_id = connection.id().clone();
        let displaced = {
            let mut connections = self.connections.write().await;
            let displaced = connections.insert(client_id.clone(), connection);
            self.active.store(connections.len(), Ordering::Relaxed);
            displaced
        };

        self.total_registered.fetch_add(1, Ordering::Relaxed);

        if let Some(old) = &displaced {
            self.replaced.fetch_add(1, Ordering::Relaxed);
            info!(
                client_id = %client_id,
                connection_id = %connection_id,
                displaced_connection_id = %old.id(),
                "Connection replaced an existing registration"
            );
        } else {
            info!(
                client_id = %client_id,
                connection_id = %connection_id,
                active_connections = self.len(),
                "Connection registered"
            );
        }

        displaced
    }

    /// Remove whatever is registered under `client_id` and close it.
    ///
    /// Returns `false` if nothing was registered.
    pub async fn unregister(&self, client_id: &ClientId) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            let removed = connections.remove(client_id);
            self.active.store(connections.len(), Ordering::Relaxed);
            removed
        };

        match removed {
            Some(connection) => {
                connection.close();
                info!(
                    client_id = %client_id,
                    connection_id = %connection.id(),
                    "Connection unregistered"
                );
                true
            }
            None => {
                debug!(client_id = %client_id, "Attempted to unregister unknown client");
                false
            }
        }
    }

    /// Remove `connection` from under `client_id` if it is still the
    /// registered one, then close it either way.
    ///
    /// A connection that has been displaced never removes its successor.
    pub async fn unregister_connection(&self, client_id: &ClientId, connection: &ConnectionRef) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            let is_current = connections
                .get(client_id)
                .is_some_and(|current| current.id() == connection.id());
            if is_current {
                connections.remove(client_id);
                self.active.store(connections.len(), Ordering::Relaxed);
            }
            is_current
        };

        connection.close();

        if removed {
            info!(
                client_id = %client_id,
                connection_id = %connection.id(),
                "Connection unregistered"
            );
        } else {
            debug!(
                client_id = %client_id,
                connection_id = %connection.id(),
                "Connection was no longer registered"
            );
        }

        removed
    }

    /// Write `payload` to every registered connection.
    ///
    /// Writes run concurrently, each bounded by the write timeout. A failed
    /// or late write does not affect the others; the connection is
    /// unregistered and closed once the pass is over.
    pub async fn broadcast(&self, payload: &Payload) -> BroadcastReport {
        let (delivered, failed) = {
            let connections = self.connections.read().await;

            let writes = connections.iter().map(|(client_id, connection)| async move {
                let result = match timeout(self.write_timeout, connection.send(payload.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::WriteTimeout(self.write_timeout)),
                };
                (client_id, connection, result)
            });

            let mut delivered = 0;
            let mut failed = Vec::new();
            for (client_id, connection, result) in join_all(writes).await {
                match result {
                    Ok(()) => delivered += 1,
                    Err(e) => failed.push((client_id.clone(), connection.clone(), e)),
                }
            }
            (delivered, failed)
        };

        for (client_id, connection, error) in &failed {
            warn!(
                client_id = %client_id,
                connection_id = %connection.id(),
                error = %error,
                "Write failed during fan-out, dropping connection"
            );
            self.unregister_connection(client_id, connection).await;
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.failed_writes.fetch_add(failed.len() as u64, Ordering::Relaxed);

        debug!(
            delivered = delivered,
            failed = failed.len(),
            bytes = payload.len(),
            "Fan-out pass complete"
        );

        BroadcastReport {
            delivered,
            failed: failed.len(),
        }
    }

    /// Remove and close every connection. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut connections = self.connections.write().await;
            let drained = connections.drain().collect();
            self.active.store(0, Ordering::Relaxed);
            drained
        };

        for (_, connection) in &drained {
            connection.close();
        }

        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all registered connections");
        }
        drained.len()
    }

    /// Connection registered under `client_id`, if any
    pub async fn get(&self, client_id: &ClientId) -> Option<ConnectionRef> {
        self.connections.read().await.get(client_id).cloned()
    }

    pub async fn contains(&self, client_id: &ClientId) -> bool {
        self.connections.read().await.contains_key(client_id)
    }

    pub async fn identities(&self) -> Vec<ClientId> {
        self.connections.read().await.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn metrics(&self) -> RegistryMetrics {
        RegistryMetrics {
            active_connections: self.len(),
            total_registered: self.total_registered.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
        }
    }
}
