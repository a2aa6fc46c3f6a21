//! Built-in controllers: handshake and keepalive.

pub mod handshake;
pub mod keepalive;

pub use handshake::HandshakeController;
pub use keepalive::KeepAliveController;
