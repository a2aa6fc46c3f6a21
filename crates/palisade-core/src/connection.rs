//! Connection lifecycle core: state, authority, and handshake metadata.
//!
//! This is the pure, I/O-free half of a connection — state/authority
//! atomics and the connect-time metadata map. The socket-owning half (Stream
//! Handler, Security Manager, event channel) lives in `palisade-server`,
//! which embeds a [`ConnectionCore`] rather than duplicating this logic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::authority::{Authority, AtomicAuthority};
use crate::state::{AtomicConnectionState, ConnectionState};

/// Key under which the handshake handler stashes the server's ephemeral
/// X25519 private key between `StartHandshake` and `CompleteHandshake`.
pub const HANDSHAKE_PRIVATE_KEY_METADATA: &str = "handshake.server_private_key";

/// Key under which the last `StartHandshake` timestamp is stashed, to
/// detect replay within the 10-second window.
pub const LAST_HANDSHAKE_TIME_METADATA: &str = "handshake.last_start_time_ms";

struct MetadataEntry {
    value: Vec<u8>,
    inserted_at_ms: u64,
}

/// Connect-time string→opaque-bytes map used by handshake handlers.
///
/// Entries are swept by the same periodic tick that drives bandwidth-limiter
/// resets (see `palisade-server`), so a peer that starts but never completes
/// a handshake does not hold key material indefinitely.
#[derive(Default)]
pub struct Metadata {
    entries: Mutex<HashMap<String, MetadataEntry>>,
}

impl Metadata {
    /// Create an empty metadata map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    pub fn insert(&self, key: &str, value: Vec<u8>, now_ms: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(key.to_string(), MetadataEntry { value, inserted_at_ms: now_ms });
    }

    /// Read `key` without removing it.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Remove and return `key`.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    pub fn take(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(key).map(|entry| entry.value)
    }

    /// Drop entries older than `ttl_ms`.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    pub fn sweep_expired(&self, now_ms: u64, ttl_ms: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.retain(|_, entry| now_ms.saturating_sub(entry.inserted_at_ms) <= ttl_ms);
    }
}

/// The I/O-free half of a connection: lifecycle state, authority, and
/// handshake metadata.
pub struct ConnectionCore {
    state: AtomicConnectionState,
    authority: AtomicAuthority,
    metadata: Metadata,
    last_ping_at_ms: AtomicU64,
    created_at_ms: u64,
}

impl ConnectionCore {
    /// Create a core starting in `Connecting`/`Guest` at `created_at_ms`.
    #[must_use]
    pub fn new(created_at_ms: u64) -> Self {
        Self {
            state: AtomicConnectionState::new(),
            authority: AtomicAuthority::default(),
            metadata: Metadata::new(),
            last_ping_at_ms: AtomicU64::new(created_at_ms),
            created_at_ms,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Attempt a state transition; see [`ConnectionState::can_transition_to`].
    pub fn transition_to(&self, next: ConnectionState) -> bool {
        self.state.transition_to(next)
    }

    /// Demote to `Connecting` after an AEAD decrypt failure.
    pub fn demote_to_connecting(&self) -> bool {
        self.state.demote_to_connecting()
    }

    /// Current authority level.
    #[must_use]
    pub fn authority(&self) -> Authority {
        self.authority.load()
    }

    /// Promote authority (e.g. Guest to User on handshake completion).
    pub fn set_authority(&self, authority: Authority) {
        self.authority.store(authority);
    }

    /// `true` if the current authority meets `required`.
    #[must_use]
    pub fn permits(&self, required: Authority) -> bool {
        self.authority.permits(required)
    }

    /// Handshake/connect-time metadata map.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Timestamp this connection was created.
    #[must_use]
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Timestamp of the most recently observed ping/pong activity.
    #[must_use]
    pub fn last_ping_at_ms(&self) -> u64 {
        self.last_ping_at_ms.load(Ordering::Acquire)
    }

    /// Record ping/pong activity at `now_ms`.
    pub fn touch_ping(&self, now_ms: u64) {
        self.last_ping_at_ms.store(now_ms, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_connecting_guest() {
        let core = ConnectionCore::new(1_000);
        assert_eq!(core.state(), ConnectionState::Connecting);
        assert_eq!(core.authority(), Authority::Guest);
        assert_eq!(core.created_at_ms(), 1_000);
    }

    #[test]
    fn handshake_promotes_authority_and_state() {
        let core = ConnectionCore::new(0);
        assert!(core.transition_to(ConnectionState::Connected));
        assert!(core.transition_to(ConnectionState::Authenticated));
        core.set_authority(Authority::User);
        assert!(core.permits(Authority::User));
    }

    #[test]
    fn metadata_round_trips_and_sweeps_by_ttl() {
        let metadata = Metadata::new();
        metadata.insert(HANDSHAKE_PRIVATE_KEY_METADATA, vec![1, 2, 3], 1_000);
        assert_eq!(metadata.get(HANDSHAKE_PRIVATE_KEY_METADATA), Some(vec![1, 2, 3]));

        metadata.sweep_expired(1_500, 1_000);
        assert!(metadata.get(HANDSHAKE_PRIVATE_KEY_METADATA).is_some());

        metadata.sweep_expired(5_000, 1_000);
        assert!(metadata.get(HANDSHAKE_PRIVATE_KEY_METADATA).is_none());
    }

    #[test]
    fn metadata_take_removes_entry() {
        let metadata = Metadata::new();
        metadata.insert("k", vec![9], 0);
        assert_eq!(metadata.take("k"), Some(vec![9]));
        assert_eq!(metadata.get("k"), None);
    }

    #[test]
    fn ping_touch_updates_timestamp() {
        let core = ConnectionCore::new(0);
        core.touch_ping(42);
        assert_eq!(core.last_ping_at_ms(), 42);
    }
}
