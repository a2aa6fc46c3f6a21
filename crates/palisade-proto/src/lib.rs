//! Wire codec and LZ4 block engine for the connection runtime.
//!
//! This crate has no knowledge of sockets, sessions, or authentication — it
//! only knows how to turn bytes into [`packet::Packet`]s and back, and how to
//! shrink payloads with the custom LZ4 block format in [`lz4`].

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod error;
pub mod header;
pub mod lz4;
pub mod opcode;
pub mod packet;
pub mod pool;

pub use error::{ProtocolError, Result};
pub use header::{PacketHeader, PayloadType, FLAG_COMPRESSED, FLAG_ENCRYPTED};
pub use packet::Packet;
pub use pool::{BufferPool, PooledBuffer, SharedBufferPool, STACK_THRESHOLD};
