//! The socket-owning half of a connection.
//!
//! [`palisade_core::ConnectionCore`] is the pure state/authority/metadata
//! half; this type adds the socket (via [`StreamHandler`]), the per-session
//! [`SecurityManager`], and the event wiring that neither of those should
//! know about. Ownership points down - `Connection` owns the
//! `StreamHandler`, never the reverse - and upward signaling is the
//! `on_packet` callback passed at construction, not a stored back-pointer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use palisade_core::{Authority, Clock, ConnectionCore, ConnectionState, IncomingFifoCache};
use palisade_crypto::SecurityManager;
use palisade_proto::{lz4, BufferPool, Packet, PayloadType, FLAG_COMPRESSED, FLAG_ENCRYPTED};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::firewall::BandwidthLimiter;
use crate::stream_handler::StreamHandler;

/// Maximum age (ms) before a received frame is treated as expired and
/// dropped without dispatch.
const FRAME_MAX_AGE_MS: u64 = 30_000;

/// Payloads at or below this size are sent as-is; larger ones are run
/// through the LZ4 block compressor and only kept compressed if it actually
/// shrank the frame.
const COMPRESS_THRESHOLD_BYTES: usize = 128;

/// One live TCP connection: socket, crypto, lifecycle state, and the caches
/// that buffer between the receive loop and dispatch.
pub struct Connection {
    id: String,
    remote_endpoint: String,
    core: ConnectionCore,
    security: StdMutex<SecurityManager>,
    stream: Arc<StreamHandler>,
    dispatcher: Arc<Dispatcher>,
    bandwidth: Arc<BandwidthLimiter>,
    clock: Arc<dyn Clock>,
    pool: Arc<dyn BufferPool>,
    incoming: IncomingFifoCache,
    notify: Notify,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl Connection {
    /// Construct a connection around an already-accepted socket.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        remote_endpoint: String,
        socket: tokio::net::TcpStream,
        max_frame: usize,
        dispatcher: Arc<Dispatcher>,
        bandwidth: Arc<BandwidthLimiter>,
        clock: Arc<dyn Clock>,
        pool: Arc<dyn BufferPool>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let stream = Arc::new(StreamHandler::new(socket, Arc::clone(&pool), max_frame, cancel.child_token()));
        let now = clock.unix_ms_now();

        Arc::new(Self {
            id,
            remote_endpoint,
            core: ConnectionCore::new(now),
            security: StdMutex::new(SecurityManager::new()),
            stream,
            dispatcher,
            bandwidth,
            clock,
            pool,
            incoming: IncomingFifoCache::new(),
            notify: Notify::new(),
            cancel,
            disposed: AtomicBool::new(false),
        })
    }

    /// Opaque, string-printable session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote peer address as accepted.
    #[must_use]
    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    /// The pure state/authority/metadata half of this connection.
    #[must_use]
    pub fn core(&self) -> &ConnectionCore {
        &self.core
    }

    /// `true` once the handshake has completed and payloads are AEAD-sealed.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.core.state() == ConnectionState::Authenticated
    }

    /// This side's X25519 public key, sent to the peer during handshake.
    #[must_use]
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    pub fn public_key(&self) -> [u8; 32] {
        self.security.lock().unwrap_or_else(std::sync::PoisonError::into_inner).public_key()
    }

    /// Derive the session key from the peer's public key (handshake start).
    ///
    /// # Errors
    ///
    /// Propagates [`palisade_crypto::CryptoError`] on a bad key or a second
    /// derive attempt.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    pub fn derive_session_key(&self, peer_public: &[u8]) -> palisade_crypto::Result<()> {
        self.security.lock().unwrap_or_else(std::sync::PoisonError::into_inner).derive_session_key(peer_public)
    }

    /// Re-derive and compare against the committed session key (handshake
    /// confirmation).
    ///
    /// # Errors
    ///
    /// Propagates [`palisade_crypto::CryptoError`] if no key has been
    /// derived yet or `peer_public` is malformed.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    pub fn confirm_session_key(&self, peer_public: &[u8]) -> palisade_crypto::Result<bool> {
        self.security.lock().unwrap_or_else(std::sync::PoisonError::into_inner).confirm_session_key(peer_public)
    }

    /// Current wall-clock time as seen by this connection's injected clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.unix_ms_now()
    }

    /// Charge `n` bytes of inbound traffic against this connection's
    /// bandwidth budget.
    pub async fn charge_rate_limit(&self, n: usize) -> bool {
        #[allow(clippy::cast_possible_truncation)]
        let n = n.min(usize::from(u32::MAX)) as u32;
        self.bandwidth.try_download(&self.remote_endpoint, n).await
    }

    /// Build, optionally compress and encrypt, and send a reply framed under
    /// `id` with application status `code` and payload type `kind`.
    ///
    /// Compresses the payload first when it is larger than
    /// [`COMPRESS_THRESHOLD_BYTES`] and LZ4 actually shrinks it, then wraps
    /// it with [`SecurityManager::encrypt`] when this connection is
    /// `Authenticated`, then hands the encoded frame to the stream handler.
    /// Returns `false` on any encode or write failure.
    pub async fn send(&self, id: u16, code: u16, kind: PayloadType, payload: impl Into<Bytes>) -> bool {
        let payload = payload.into();
        let now = self.now_ms();

        let (body, compressed) = if payload.len() > COMPRESS_THRESHOLD_BYTES {
            let packed = lz4::compress(&payload);
            if packed.len() < payload.len() {
                (Bytes::from(packed), true)
            } else {
                (payload, false)
            }
        } else {
            (payload, false)
        };

        let (body, encrypted) = if self.is_authenticated() {
            #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
            let sealed =
                self.security.lock().unwrap_or_else(std::sync::PoisonError::into_inner).encrypt(&body);
            match sealed {
                Ok(sealed) => (Bytes::from(sealed), true),
                Err(err) => {
                    tracing::warn!(%err, "encrypt failed, dropping outbound reply");
                    return false;
                },
            }
        } else {
            (body, false)
        };

        let mut packet = match Packet::new(id, body, now) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(%err, "reply payload too large, dropping");
                return false;
            },
        };
        packet.header.set_code(code);
        packet.header.set_payload_type(kind);
        let mut flags = packet.header.flags();
        if compressed {
            flags |= FLAG_COMPRESSED;
        }
        if encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        packet.header.set_flags(flags);

        let wire = match packet.encode_pooled(&*self.pool) {
            Ok(wire) => wire,
            Err(err) => {
                tracing::warn!(%err, "failed to encode reply frame");
                return false;
            },
        };

        let sent = self.stream.send(&wire).await;
        if sent {
            tracing::trace!(opcode = format!("{id:#06x}"), "reply sent");
        }
        sent
    }

    /// Same as [`Self::send`], but cancellable via `cancel`.
    pub async fn send_async(
        &self,
        id: u16,
        code: u16,
        kind: PayloadType,
        payload: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            ok = self.send(id, code, kind, payload) => ok,
        }
    }

    /// Run the receive loop and dispatch loop concurrently until the peer
    /// disconnects or `dispose` is called. Returns once both have stopped.
    pub async fn run(self: &Arc<Self>) {
        let process_task = {
            let conn = Arc::clone(self);
            tokio::spawn(async move { conn.process_loop().await })
        };

        let receive = Arc::clone(self);
        self.stream
            .begin_receive(
                |raw| Ok(Bytes::copy_from_slice(raw)),
                move |raw| {
                    receive.incoming.push(raw);
                    receive.notify.notify_one();
                },
            )
            .await;

        self.cancel.cancel();
        let _ = process_task.await;
    }

    async fn process_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled(), if self.incoming.is_empty() => break,
                () = self.notify.notified() => {},
            }
            while let Some(raw) = self.incoming.pop() {
                self.process_inbound(&raw).await;
            }
        }
    }

    async fn process_inbound(self: &Arc<Self>, raw: &Bytes) {
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(%err, "dropping undecodable frame");
                return;
            },
        };

        if !packet.is_valid() {
            tracing::warn!(opcode = format!("{:#06x}", packet.header.id()), "checksum mismatch, dropping frame");
            return;
        }

        if packet.is_expired(self.now_ms(), FRAME_MAX_AGE_MS) {
            tracing::debug!(opcode = format!("{:#06x}", packet.header.id()), "dropping expired frame");
            return;
        }

        let packet = if self.is_authenticated() {
            #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
            let plain =
                self.security.lock().unwrap_or_else(std::sync::PoisonError::into_inner).decrypt(&packet.payload);
            match plain {
                Ok(plain) => Packet { header: packet.header, payload: Bytes::from(plain) },
                Err(err) => {
                    self.core.demote_to_connecting();
                    tracing::warn!(%err, "AEAD decrypt failed, demoting to Connecting");
                    return;
                },
            }
        } else {
            packet
        };

        let packet = if packet.header.is_compressed() {
            match lz4::decompress(&packet.payload) {
                Ok(plain) => Packet { header: packet.header, payload: Bytes::from(plain) },
                Err(err) => {
                    tracing::warn!(%err, "LZ4 decompress failed, dropping frame");
                    return;
                },
            }
        } else {
            packet
        };

        self.core.touch_ping(self.now_ms());
        self.dispatcher.dispatch(self, packet).await;
    }

    /// Promote to `Connected`/`Authenticated`/demote as the handshake
    /// handlers drive it. See `handlers::handshake`.
    pub fn transition_to(&self, next: ConnectionState) -> bool {
        self.core.transition_to(next)
    }

    /// Promote authority (Guest → User on handshake completion).
    pub fn set_authority(&self, authority: Authority) {
        self.core.set_authority(authority);
    }

    /// Idempotent teardown: cancels the shared token, shuts down the
    /// socket, and marks this connection disconnected.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.stream.dispose().await;
        self.core.transition_to(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use palisade_core::SystemClock;
    use palisade_proto::opcode::OP_PING;
    use palisade_proto::pool::SharedBufferPool;
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

    async fn test_connection() -> (Arc<Connection>, TcpStream) {
        let (server_sock, client_sock) = connected_pair().await;
        let dispatcher = Arc::new(DispatcherBuilder::new().build());
        let bandwidth = BandwidthLimiter::new(FirewallConfig::default()).expect("valid config");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pool: Arc<dyn BufferPool> = Arc::new(SharedBufferPool::new(1 << 20));

        let connection = Connection::new(
            "conn-1".to_string(),
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
    async fn starts_connecting_and_unauthenticated() {
        let (connection, _client) = test_connection().await;
        assert_eq!(connection.core().state(), ConnectionState::Connecting);
        assert!(!connection.is_authenticated());
    }

    #[tokio::test]
    async fn unauthenticated_send_is_not_encrypted() {
        let (connection, mut client) = test_connection().await;
        assert!(connection.send(0x0010, 0, PayloadType::Binary, b"hi".to_vec()).await);

        let mut prefix = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut prefix).await.expect("read prefix");
        let length = u16::from_le_bytes(prefix) as usize;
        let mut rest = vec![0u8; length - 2];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut rest).await.expect("read body");

        let mut wire = prefix.to_vec();
        wire.extend_from_slice(&rest);
        let packet = Packet::decode(&wire).expect("decode");
        assert!(!packet.header.is_encrypted());
        assert_eq!(&packet.payload[..], b"hi");
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (connection, _client) = test_connection().await;
        connection.dispose().await;
        connection.dispose().await;
        assert_eq!(connection.core().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn authenticated_connection_decrypts_even_without_encrypted_flag() {
        let (connection, _client) = test_connection().await;

        let server_public = connection.public_key();
        let mut peer_security = SecurityManager::new();
        let peer_public = peer_security.public_key();
        peer_security.derive_session_key(&server_public).expect("peer derive");
        connection.derive_session_key(&peer_public).expect("server derive");
        connection.transition_to(ConnectionState::Connected);
        connection.transition_to(ConnectionState::Authenticated);

        let sealed = peer_security.encrypt(b"ping").expect("encrypt");
        let packet = Packet::new(OP_PING, Bytes::from(sealed), connection.now_ms()).expect("fits");
        assert!(!packet.header.is_encrypted());
        let mut raw = Vec::new();
        packet.encode(&mut raw).expect("encode");

        connection.process_inbound(&Bytes::from(raw)).await;

        assert_eq!(connection.core().state(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn large_payload_is_compressed_on_send() {
        let (connection, mut client) = test_connection().await;
        let payload = vec![b'A'; 1024];
        assert!(connection.send(0x0010, 0, PayloadType::Binary, payload.clone()).await);

        let mut prefix = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut prefix).await.expect("read prefix");
        let length = u16::from_le_bytes(prefix) as usize;
        let mut rest = vec![0u8; length - 2];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut rest).await.expect("read body");

        let mut wire = prefix.to_vec();
        wire.extend_from_slice(&rest);
        let packet = Packet::decode(&wire).expect("decode");
        assert!(packet.header.is_compressed());
        let recovered = lz4::decompress(&packet.payload).expect("decompress");
        assert_eq!(recovered, payload);
    }
}
