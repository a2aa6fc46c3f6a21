//! Built-in X25519 + ChaCha20-Poly1305 handshake controller.
//!
//! `StartHandshake` accepts the client's public key, derives the session
//! key, and replies with the server's public key. `CompleteHandshake` asks
//! the security manager to re-derive and compare against the committed key
//! without exposing it, then confirms or rejects.

use std::sync::Arc;

use bytes::Bytes;
use palisade_core::{Authority, ConnectionState, CoreError, LAST_HANDSHAKE_TIME_METADATA};
use palisade_proto::opcode::{OP_COMPLETE_HANDSHAKE, OP_START_HANDSHAKE};
use palisade_proto::{Packet, PayloadType};

use crate::connection::Connection;
use crate::dispatcher::{Controller, DispatcherBuilder, HandlerPolicy, Reply};

const CODE_SUCCESS: u16 = 0;
const CODE_CONFLICT: u16 = 1;

const CLIENT_PUBLIC_KEY_LEN: usize = 32;
const REPLAY_WINDOW_MS: u64 = 10_000;

/// Registers `StartHandshake` and `CompleteHandshake`.
pub struct HandshakeController;

impl Controller for HandshakeController {
    fn register(builder: &mut DispatcherBuilder) -> Result<(), CoreError> {
        builder.register(
            OP_START_HANDSHAKE,
            HandlerPolicy::default(),
            Arc::new(|connection, packet| Box::pin(start_handshake(connection, packet))),
        )?;

        builder.register(
            OP_COMPLETE_HANDSHAKE,
            HandlerPolicy::default(),
            Arc::new(|connection, packet| Box::pin(complete_handshake(connection, packet))),
        )?;

        Ok(())
    }
}

async fn start_handshake(connection: Arc<Connection>, packet: Packet) -> Option<Reply> {
    let payload = packet.payload;
    if packet.header.payload_type() != PayloadType::Binary || payload.len() != CLIENT_PUBLIC_KEY_LEN {
        tracing::warn!(len = payload.len(), "StartHandshake payload is not a 32-byte binary public key");
        return None;
    }

    let now = connection.now_ms();
    let metadata = connection.core().metadata();
    if let Some(last) = metadata.get(LAST_HANDSHAKE_TIME_METADATA) {
        if let Ok(bytes) = <[u8; 8]>::try_from(last.as_slice()) {
            let last_ms = u64::from_le_bytes(bytes);
            if now.saturating_sub(last_ms) < REPLAY_WINDOW_MS {
                tracing::warn!("rejecting StartHandshake within the replay window");
                return None;
            }
        }
    }

    connection.transition_to(ConnectionState::Connected);

    if let Err(err) = connection.derive_session_key(&payload) {
        tracing::warn!(%err, "failed to derive session key");
        return None;
    }

    connection.set_authority(Authority::User);
    metadata.insert(LAST_HANDSHAKE_TIME_METADATA, now.to_le_bytes().to_vec(), now);

    Some(Reply::new(OP_START_HANDSHAKE, Bytes::copy_from_slice(&connection.public_key())))
}

async fn complete_handshake(connection: Arc<Connection>, packet: Packet) -> Option<Reply> {
    let payload = packet.payload;
    if packet.header.payload_type() != PayloadType::Binary || payload.len() != CLIENT_PUBLIC_KEY_LEN {
        tracing::warn!(len = payload.len(), "CompleteHandshake payload is not a 32-byte binary public key");
        return None;
    }

    let confirmed = match connection.confirm_session_key(&payload) {
        Ok(confirmed) => confirmed,
        Err(err) => {
            tracing::warn!(%err, "failed to confirm session key");
            return None;
        },
    };

    if confirmed {
        connection.transition_to(ConnectionState::Authenticated);
        Some(Reply::with_code(OP_COMPLETE_HANDSHAKE, CODE_SUCCESS, Bytes::new()))
    } else {
        Some(Reply::with_code(OP_COMPLETE_HANDSHAKE, CODE_CONFLICT, Bytes::new()))
    }
}
