//! Framed receive loop and send path for one connection's socket.
//!
//! Reads are owned exclusively by [`StreamHandler::begin_receive`], which a
//! caller spawns as its own task; writes are serialized behind an internal
//! lock so concurrent `send`/`send_async` callers never interleave mid-frame:
//! a write of a complete frame is always atomic with respect to other writes
//! on the same stream.
//!
//! The wire frame's own `Length` field (the first two bytes of every
//! [`palisade_proto::PacketHeader`]) doubles as the stream's length prefix,
//! so there is no separate framing layer to maintain: read two bytes, that's
//! the total frame size, read the rest.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use palisade_core::{fingerprint, CoreError, OutgoingDedupCache};
use palisade_proto::BufferPool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const LENGTH_PREFIX_LEN: usize = 2;
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Minimum payload length accepted by [`StreamHandler::send`]; shorter
/// calls must use [`StreamHandler::send_async`] instead.
pub const MIN_SYNC_SEND_LEN: usize = 9;

/// Owns one connection's socket halves and drives its framed receive loop
/// and serialized send path.
///
/// Crypto-agnostic by design: it moves whole frames (header + payload,
/// whatever that payload currently is) in and out. Decryption, packet
/// decoding, and checksum validation are the caller's job, performed inside
/// the `on_packet` callback given to [`Self::begin_receive`] - see
/// `crate::connection` for where that actually happens.
pub struct StreamHandler {
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<OwnedWriteHalf>,
    pool: Arc<dyn BufferPool>,
    buf: Mutex<Vec<u8>>,
    buf_len: AtomicUsize,
    max_frame: usize,
    outgoing_dedup: OutgoingDedupCache,
    cancel: CancellationToken,
}

impl StreamHandler {
    /// Wrap `socket`, splitting it into independently lockable read/write
    /// halves. `max_frame` bounds the largest frame this handler accepts
    /// before it gives up on the peer; `cancel` is the single token that
    /// governs the receive loop and both send paths.
    #[must_use]
    pub fn new(socket: TcpStream, pool: Arc<dyn BufferPool>, max_frame: usize, cancel: CancellationToken) -> Self {
        let (read_half, write_half) = socket.into_split();
        let initial = pool.rent(INITIAL_BUFFER_SIZE);
        let buf_len = AtomicUsize::new(initial.len());

        Self {
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
            pool,
            buf: Mutex::new(initial),
            buf_len,
            max_frame,
            outgoing_dedup: OutgoingDedupCache::new(),
            cancel,
        }
    }

    /// Run the framed receive loop until the peer disconnects, a frame
    /// exceeds `max_frame`, or the linked cancellation token fires.
    ///
    /// `transform` is applied to each raw frame before it is handed to
    /// `on_packet`; the identity transform is the common case, with
    /// decrypt-then-decode logic living in `on_packet` instead (see
    /// `crate::connection::Connection::process_inbound`). Must be called at
    /// most once per `StreamHandler`.
    pub async fn begin_receive<T, P>(&self, transform: T, on_packet: P)
    where
        T: Fn(&[u8]) -> Result<Bytes, CoreError>,
        P: Fn(Bytes),
    {
        let Some(mut read_half) = self.read_half.lock().await.take() else {
            tracing::warn!("begin_receive called more than once on the same stream handler");
            return;
        };

        loop {
            let mut prefix = [0u8; LENGTH_PREFIX_LEN];
            let read_prefix = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = read_half.read_exact(&mut prefix) => result,
            };

            if read_prefix.is_err() {
                // Fewer than 2 bytes before EOF/reset: orderly shutdown.
                break;
            }

            let length = usize::from(u16::from_le_bytes(prefix));

            if length > self.max_frame {
                tracing::warn!(length, max_frame = self.max_frame, "frame exceeds max_frame, closing");
                break;
            }

            self.ensure_capacity(length).await;

            let mut buf = self.buf.lock().await;
            buf[..LENGTH_PREFIX_LEN].copy_from_slice(&prefix);

            if length > LENGTH_PREFIX_LEN {
                let read_body = tokio::select! {
                    () = self.cancel.cancelled() => break,
                    result = read_half.read_exact(&mut buf[LENGTH_PREFIX_LEN..length]) => result,
                };
                if read_body.is_err() {
                    break;
                }
            }

            match transform(&buf[..length]) {
                Ok(payload) => {
                    drop(buf);
                    on_packet(payload);
                },
                Err(err) => tracing::warn!(%err, "dropping frame that failed transform"),
            }
        }
    }

    async fn ensure_capacity(&self, needed: usize) {
        if self.buf_len.load(Ordering::Acquire) >= needed {
            return;
        }

        let mut buf = self.buf.lock().await;
        if buf.len() >= needed {
            return;
        }

        let old = std::mem::replace(&mut *buf, self.pool.rent(needed));
        self.buf_len.store(buf.len(), Ordering::Release);
        self.pool.give_back(old, true);
    }

    /// Write a complete wire frame. Fails (returns `false`) without writing
    /// if `bytes.len() < `[`MIN_SYNC_SEND_LEN`].
    pub async fn send(&self, bytes: &[u8]) -> bool {
        if bytes.len() < MIN_SYNC_SEND_LEN {
            return false;
        }
        self.record_and_write(bytes).await
    }

    /// Write a complete wire frame, racing against `cancel`. Fails without
    /// writing if `bytes` is empty.
    pub async fn send_async(&self, bytes: &[u8], cancel: &CancellationToken) -> bool {
        if bytes.is_empty() {
            return false;
        }

        tokio::select! {
            () = cancel.cancelled() => false,
            ok = self.record_and_write(bytes) => ok,
        }
    }

    async fn record_and_write(&self, bytes: &[u8]) -> bool {
        self.outgoing_dedup.record(fingerprint(bytes));
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(bytes).await.is_ok()
    }

    /// Cancel the receive loop and shut down the write half. Safe to call
    /// more than once.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
    }
}

impl Drop for StreamHandler {
    fn drop(&mut self) {
        if let Ok(mut buf) = self.buf.try_lock() {
            let owned = std::mem::take(&mut *buf);
            self.pool.give_back(owned, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use palisade_proto::pool::SharedBufferPool;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let connector = TcpStream::connect(addr);
        let (server, (client, _)) = tokio::join!(connector, listener.accept());
        (server.expect("connect"), client.expect("accept"))
    }

    #[tokio::test]
    async fn receives_length_prefixed_frames_in_order() {
        let (server_sock, mut client_sock) = connected_pair().await;
        let pool: Arc<dyn BufferPool> = Arc::new(SharedBufferPool::new(1 << 16));
        let handler = Arc::new(StreamHandler::new(server_sock, pool, 65536, CancellationToken::new()));

        let frame_a = build_frame(b"aaaa");
        let frame_b = build_frame(b"bbbbbbbb");
        client_sock.write_all(&frame_a).await.expect("write a");
        client_sock.write_all(&frame_b).await.expect("write b");
        drop(client_sock);

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let handler_clone = Arc::clone(&handler);

        handler_clone
            .begin_receive(
                |raw| Ok(Bytes::copy_from_slice(raw)),
                |payload| {
                    let received = Arc::clone(&received_clone);
                    tokio::spawn(async move {
                        received.lock().await.push(payload);
                    });
                },
            )
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let got = received.lock().await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], Bytes::from(frame_a));
        assert_eq!(got[1], Bytes::from(frame_b));
    }

    fn build_frame(body: &[u8]) -> Vec<u8> {
        let total = LENGTH_PREFIX_LEN + body.len();
        #[allow(clippy::cast_possible_truncation)]
        let mut out = (total as u16).to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_loop() {
        let (server_sock, mut client_sock) = connected_pair().await;
        let pool: Arc<dyn BufferPool> = Arc::new(SharedBufferPool::new(1 << 16));
        let handler = Arc::new(StreamHandler::new(server_sock, pool, 16, CancellationToken::new()));

        let frame = build_frame(&[0u8; 64]);
        client_sock.write_all(&frame).await.expect("write");
        drop(client_sock);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        handler
            .begin_receive(
                |raw| Ok(Bytes::copy_from_slice(raw)),
                move |_| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_rejects_short_messages() {
        let (server_sock, _client_sock) = connected_pair().await;
        let pool: Arc<dyn BufferPool> = Arc::new(SharedBufferPool::new(1 << 16));
        let handler = StreamHandler::new(server_sock, pool, 65536, CancellationToken::new());

        assert!(!handler.send(&[0u8; 4]).await);
        assert!(handler.send(&[0u8; 9]).await);
    }

    #[tokio::test]
    async fn send_async_rejects_empty_messages() {
        let (server_sock, _client_sock) = connected_pair().await;
        let pool: Arc<dyn BufferPool> = Arc::new(SharedBufferPool::new(1 << 16));
        let handler = StreamHandler::new(server_sock, pool, 65536, CancellationToken::new());

        assert!(!handler.send_async(&[], &CancellationToken::new()).await);
        assert!(handler.send_async(&[1], &CancellationToken::new()).await);
    }
}
