//! Shared state machine, caches, and errors for the connection runtime.
//!
//! No sockets and no async I/O live here — just the pieces that need to be
//! testable without a network: lifecycle state, authority, connect-time
//! metadata, the outgoing/incoming caches, the clock abstraction, and the
//! error taxonomy that `palisade-server` converts into wire responses.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod authority;
pub mod cache;
pub mod connection;
pub mod env;
pub mod error;
pub mod state;

pub use authority::{Authority, AtomicAuthority};
pub use cache::{fingerprint, IncomingFifoCache, OutgoingDedupCache};
pub use connection::{
    ConnectionCore, Metadata, HANDSHAKE_PRIVATE_KEY_METADATA, LAST_HANDSHAKE_TIME_METADATA,
};
pub use env::{Clock, FixedClock, SystemClock};
pub use error::CoreError;
pub use state::{AtomicConnectionState, ConnectionState};
