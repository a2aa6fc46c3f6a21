//! Built-in liveness controller: `Ping`/`Pong` and `PingTime` reporting.

use std::sync::Arc;

use bytes::Bytes;
use palisade_core::CoreError;
use palisade_proto::opcode::{OP_PING, OP_PING_TIME, OP_PONG};
use palisade_proto::{Packet, PayloadType};

use crate::connection::Connection;
use crate::dispatcher::{Controller, DispatcherBuilder, HandlerPolicy, Reply};

const PONG_PAYLOAD: &[u8] = b"Pong";

/// Registers `Ping` and `PingTime`.
pub struct KeepAliveController;

impl Controller for KeepAliveController {
    fn register(builder: &mut DispatcherBuilder) -> Result<(), CoreError> {
        builder.register(
            OP_PING,
            HandlerPolicy::default(),
            Arc::new(|connection, packet| Box::pin(ping(connection, packet))),
        )?;

        builder.register(
            OP_PING_TIME,
            HandlerPolicy::default(),
            Arc::new(|connection, packet| Box::pin(ping_time(connection, packet))),
        )?;

        Ok(())
    }
}

async fn ping(_connection: Arc<Connection>, _packet: Packet) -> Option<Reply> {
    Some(Reply::with_type(OP_PONG, PayloadType::String, Bytes::from_static(PONG_PAYLOAD)))
}

async fn ping_time(connection: Arc<Connection>, _packet: Packet) -> Option<Reply> {
    let last_ping = connection.core().last_ping_at_ms();
    Some(Reply::new(OP_PING_TIME, Bytes::copy_from_slice(&last_ping.to_le_bytes())))
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

    async fn test_connection() -> Arc<Connection> {
        let (server_sock, _client) = connected_pair().await;
        let dispatcher = Arc::new(DispatcherBuilder::new().build());
        let bandwidth = BandwidthLimiter::new(FirewallConfig::default()).expect("valid config");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pool: Arc<dyn BufferPool> = Arc::new(SharedBufferPool::new(1 << 20));

        Connection::new(
            "conn-1".to_string(),
            "127.0.0.1:9".to_string(),
            server_sock,
            65536,
            dispatcher,
            bandwidth,
            clock,
            pool,
        )
    }

    #[tokio::test]
    async fn ping_replies_with_pong_payload() {
        let connection = test_connection().await;
        let packet = Packet::new(OP_PING, Bytes::new(), 0).expect("fits");
        let reply = ping(connection, packet).await.expect("ping replies");
        assert_eq!(reply.id, OP_PONG);
        assert_eq!(&reply.payload[..], PONG_PAYLOAD);
    }

    #[tokio::test]
    async fn ping_time_reports_last_ping_timestamp() {
        let connection = test_connection().await;
        connection.core().touch_ping(12_345);
        let packet = Packet::new(OP_PING_TIME, Bytes::new(), 0).expect("fits");
        let reply = ping_time(connection, packet).await.expect("ping_time replies");
        assert_eq!(u64::from_le_bytes(reply.payload[..].try_into().expect("8 bytes")), 12_345);
    }
}
