//! Connection runtime: accepts TCP connections, drives the handshake and
//! packet dispatch for each one, and enforces per-endpoint bandwidth limits.
//!
//! No sockets or async I/O live in `palisade-core`/`palisade-proto`; this
//! crate is where they meet a real `TcpListener` and a registry of live
//! connections.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod firewall;
pub mod handlers;
pub mod registry;
pub mod stream_handler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use palisade_core::{Clock, SystemClock};
use palisade_proto::pool::SharedBufferPool;
use palisade_proto::BufferPool;
use tokio::net::TcpListener;

pub use config::ServerConfig;
pub use connection::Connection;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::ServerError;
pub use firewall::{BandwidthLimiter, FirewallConfig};
pub use registry::ConnectionRegistry;

/// Largest buffer the shared pool will hand out before falling back to a
/// one-off heap allocation.
const POOL_MAX_BUFFER_SIZE: usize = 1 << 20;

/// Owns the listener, the dispatcher table, the bandwidth limiter, and the
/// live-connection registry.
pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    bandwidth: Arc<BandwidthLimiter>,
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    pool: Arc<dyn BufferPool>,
    max_frame: usize,
    next_session_id: AtomicU64,
}

impl Server {
    /// Bind a listener and build the dispatch table from the built-in
    /// controllers.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` if the bind fails; `ServerError::Config` if
    /// `config.firewall` does not validate or if handler registration hits
    /// a duplicate OpCode.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind).await?;

        let mut builder = DispatcherBuilder::new();
        builder
            .register_controller::<handlers::HandshakeController>()
            .map_err(|err| ServerError::Config(err.to_string()))?;
        builder
            .register_controller::<handlers::KeepAliveController>()
            .map_err(|err| ServerError::Config(err.to_string()))?;
        let dispatcher = Arc::new(builder.build());

        let bandwidth =
            BandwidthLimiter::new(config.firewall).map_err(|err| ServerError::Config(err.to_string()))?;

        Ok(Self {
            listener,
            dispatcher,
            bandwidth,
            registry: Arc::new(ConnectionRegistry::new()),
            clock: Arc::new(SystemClock),
            pool: Arc::new(SharedBufferPool::new(POOL_MAX_BUFFER_SIZE)),
            max_frame: config.max_frame,
            next_session_id: AtomicU64::new(1),
        })
    }

    /// The address actually bound (useful when `config.bind` used port 0).
    ///
    /// # Errors
    ///
    /// Propagates any OS-level failure reading the bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener errors out. Each accepted
    /// socket gets its own `Connection` and is registered before its
    /// receive/dispatch loop starts.
    ///
    /// # Errors
    ///
    /// Returns the terminal `accept` error; transient per-connection
    /// failures are logged and do not stop the loop.
    pub async fn run(self) -> Result<(), ServerError> {
        let dispatcher = self.dispatcher;
        let bandwidth = self.bandwidth;
        let registry = self.registry;
        let clock = self.clock;
        let pool = self.pool;
        let max_frame = self.max_frame;

        loop {
            let (socket, remote) = self.listener.accept().await?;
            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed).to_string();

            let connection = Connection::new(
                id.clone(),
                remote.to_string(),
                socket,
                max_frame,
                Arc::clone(&dispatcher),
                Arc::clone(&bandwidth),
                Arc::clone(&clock),
                Arc::clone(&pool),
            );

            if !registry.add(Arc::clone(&connection)).await {
                tracing::warn!(session = %id, "duplicate session id, dropping connection");
                connection.dispose().await;
                continue;
            }

            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                connection.run().await;
                registry.remove(&id).await;
            });
        }
    }
}
