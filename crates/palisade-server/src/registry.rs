//! Live-connection registry: add/remove/broadcast across every session a
//! server instance currently holds open.
//!
//! A bare `HashMap` guarded by a single lock, not `dashmap` - the same
//! lock-guarded-map idiom used everywhere else in this crate, generalized
//! from one id → one entry instead of the bidirectional session/room maps a
//! chat-style registry would need.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use palisade_proto::PayloadType;
use tokio::sync::RwLock;

use crate::connection::Connection;

/// Tracks every currently-open [`Connection`], keyed by its session id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection`. Returns `false` if its id is already present.
    pub async fn add(&self, connection: Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        if connections.contains_key(connection.id()) {
            return false;
        }
        connections.insert(connection.id().to_string(), connection);
        true
    }

    /// Remove and return the connection registered under `id`, if any.
    pub async fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(id)
    }

    /// Look up a live connection by id.
    pub async fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Number of currently-registered connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// `true` if no connections are registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Send `payload` under opcode `id`/status `code` to every registered
    /// connection. A per-connection send failure is logged and does not
    /// stop the broadcast.
    pub async fn broadcast(&self, id: u16, code: u16, kind: PayloadType, payload: Bytes) {
        let targets: Vec<Arc<Connection>> = self.connections.read().await.values().cloned().collect();
        for connection in targets {
            if !connection.send(id, code, kind, payload.clone()).await {
                tracing::warn!(connection = connection.id(), "broadcast send failed");
            }
        }
    }

    /// Dispose every registered connection and clear the registry.
    /// Idempotent: calling this on an already-empty registry is a no-op.
    pub async fn dispose(&self) {
        let mut connections = self.connections.write().await;
        for connection in connections.values() {
            connection.dispose().await;
        }
        connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use palisade_core::{Clock, SystemClock};
    use palisade_proto::pool::SharedBufferPool;
    use palisade_proto::BufferPool;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::dispatcher::DispatcherBuilder;
    use crate::firewall::{BandwidthLimiter, FirewallConfig};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let connector = TcpStream::connect(addr);
        let (server, (client, _)) = tokio::join!(connector, listener.accept());
        (server.expect("connect"), client.expect("accept"))
    }

    async fn test_connection(id: &str) -> (Arc<Connection>, TcpStream) {
        let (server_sock, client_sock) = connected_pair().await;
        let dispatcher = Arc::new(DispatcherBuilder::new().build());
        let bandwidth = BandwidthLimiter::new(FirewallConfig::default()).expect("valid config");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pool: Arc<dyn BufferPool> = Arc::new(SharedBufferPool::new(1 << 20));

        let connection = Connection::new(
            id.to_string(),
            "127.0.0.1:9".to_string(),
            server_sock,
            65536,
            dispatcher,
            bandwidth,
            clock,
            pool,
        );
        (connection, client_sock)
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = ConnectionRegistry::new();
        let (a, _client_a) = test_connection("conn-1").await;
        let (b, _client_b) = test_connection("conn-1").await;

        assert!(registry.add(a).await);
        assert!(!registry.add(b).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_then_get_returns_none() {
        let registry = ConnectionRegistry::new();
        let (conn, _client) = test_connection("conn-1").await;
        registry.add(conn).await;

        assert!(registry.remove("conn-1").await.is_some());
        assert!(registry.get("conn-1").await.is_none());
    }

    #[tokio::test]
    async fn dispose_clears_registry() {
        let registry = ConnectionRegistry::new();
        let (conn, _client) = test_connection("conn-1").await;
        registry.add(conn).await;

        registry.dispose().await;
        assert!(registry.is_empty().await);
    }
}
