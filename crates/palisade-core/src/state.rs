//! Connection lifecycle state.
//!
//! ```text
//! Connecting ──(client pubkey received)──> Connected
//!      ▲                                        │
//!      │                                        │ ECDH+KDF succeeds
//!      └──────────(AEAD decrypt failure)─────── Authenticated
//!
//! any state ──(disconnect / socket error / dispose)──> Disconnected
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No key material yet.
    Connecting = 0,
    /// Peer public key accepted, awaiting confirmation.
    Connected = 1,
    /// Shared secret derived; all payloads are AEAD-protected.
    Authenticated = 2,
    /// Terminal; connection is gone.
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Authenticated,
            3 => Self::Disconnected,
            _ => Self::Connecting,
        }
    }

    /// `true` if moving from `self` to `next` is an allowed transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Disconnected, _) => false,
            (_, Self::Disconnected) => true,
            (_, Self::Connecting) => true,
            (Self::Connecting, Self::Connected) => true,
            (Self::Connected, Self::Authenticated) => true,
            _ => false,
        }
    }
}

/// Lock-free holder for a connection's [`ConnectionState`].
///
/// A single 32-bit atomic - state reads and writes need no reader-writer
/// lock.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    /// Start in [`ConnectionState::Connecting`].
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Connecting as u8))
    }

    /// Current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempt a transition. Returns `false` (no-op) if `next` is not
    /// reachable from the current state.
    pub fn transition_to(&self, next: ConnectionState) -> bool {
        let current = self.load();
        if !current.can_transition_to(next) {
            return false;
        }
        self.0.store(next as u8, Ordering::Release);
        true
    }

    /// Demote to [`ConnectionState::Connecting`] after an AEAD failure.
    /// Always succeeds except from the terminal `Disconnected` state.
    pub fn demote_to_connecting(&self) -> bool {
        self.transition_to(ConnectionState::Connecting)
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
