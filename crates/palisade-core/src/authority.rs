//! Monotonic authority (permission) levels.
//!
//! A handler declares the minimum authority it requires; the dispatcher
//! grants access only when `connection.authority >= handler.required`.

use std::sync::atomic::{AtomicU8, Ordering};

/// Privilege level of a connection.
///
/// Ordered: `Guest < User`. New variants must be appended after `User` to
/// preserve the ordering of values already persisted in an `AtomicU8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Authority {
    /// Default level for a connection that has not completed a handshake.
    Guest = 0,
    /// Level granted once a handshake completes successfully.
    User = 1,
}

impl Authority {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::User,
            _ => Self::Guest,
        }
    }
}

/// Lock-free holder for a connection's current [`Authority`].
///
/// A single-word atomic - reads and writes need no reader-writer lock.
#[derive(Debug)]
pub struct AtomicAuthority(AtomicU8);

impl AtomicAuthority {
    /// Start at the given authority level.
    #[must_use]
    pub fn new(authority: Authority) -> Self {
        Self(AtomicU8::new(authority as u8))
    }

    /// Current authority level.
    #[must_use]
    pub fn load(&self) -> Authority {
        Authority::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Overwrite the authority level.
    pub fn store(&self, authority: Authority) {
        self.0.store(authority as u8, Ordering::Release);
    }

    /// `true` if the current authority meets or exceeds `required`.
    #[must_use]
    pub fn permits(&self, required: Authority) -> bool {
        self.load() >= required
    }
}

impl Default for AtomicAuthority {
    fn default() -> Self {
        Self::new(Authority::Guest)
    }
}
