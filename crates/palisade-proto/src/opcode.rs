//! Well-known operation codes.
//!
//! `Id` on the wire is an opaque `u16`; application controllers are free to
//! register any value. The handful below are reserved for the built-in
//! Handshake and KeepAlive controllers.

/// Client announces its X25519 public key and begins the handshake.
pub const OP_START_HANDSHAKE: u16 = 0x0001;

/// Client confirms the derived session key.
pub const OP_COMPLETE_HANDSHAKE: u16 = 0x0002;

/// Either side requests liveness confirmation.
pub const OP_PING: u16 = 0x0010;

/// Reply to [`OP_PING`].
pub const OP_PONG: u16 = 0x0011;

/// Requests the connection's `last_ping_time`, in milliseconds.
pub const OP_PING_TIME: u16 = 0x0012;
