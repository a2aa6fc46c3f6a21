//! Error taxonomy for the connection runtime core.
//!
//! We avoid using `std::io::Error` for protocol/policy logic to keep
//! distinct failure modes (a malformed frame vs. a rate limit vs. a
//! handler timeout) distinguishable by callers instead of collapsed into
//! one opaque `Other` kind.

use std::io;

use thiserror::Error;

/// Errors surfaced by the connection state machine, caches, and dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Fewer bytes were available than the header declared.
    #[error("truncated frame: {0}")]
    Truncated(String),

    /// Header fields parsed but were structurally inconsistent.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Payload exceeds the maximum representable size.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// No controller is registered for the received opcode.
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpCode(u16),

    /// Connection's current authority does not permit this opcode.
    #[error("permission denied for opcode {0:#06x}")]
    PermissionDenied(u16),

    /// Per-connection bandwidth limit was exhausted.
    #[error("rate limited")]
    RateLimited,

    /// Opcode requires an encrypted channel but none is established.
    #[error("connection is not encrypted")]
    NotEncrypted,

    /// Encryption has not finished negotiating yet.
    #[error("encryption is not ready")]
    EncryptionNotReady,

    /// Handshake public key or replay check failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// AEAD tag verification failed.
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// A registered handler did not complete within its time budget.
    #[error("handler timed out after {elapsed_ms}ms")]
    HandlerTimeout {
        /// Elapsed time before the handler was aborted.
        elapsed_ms: u64,
    },

    /// Peer closed the socket.
    #[error("socket closed")]
    SocketClosed,

    /// Write to the socket failed.
    #[error("write error: {0}")]
    WriteError(String),

    /// Read from the socket failed.
    #[error("read error: {0}")]
    ReadError(String),

    /// Operation was canceled (e.g. via the connection's cancellation
    /// token).
    #[error("operation canceled")]
    Canceled,

    /// Connection has already been disposed; no further operations are
    /// valid.
    #[error("connection is disposed")]
    Disposed,

    /// Configuration value failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl CoreError {
    /// `true` if retrying the same operation later might succeed.
    ///
    /// Protocol violations, permission failures, and disposal are never
    /// transient - they indicate a broken peer, a policy decision, or a
    /// connection that is gone.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::HandlerTimeout { .. } | Self::Canceled)
    }
}

impl From<palisade_proto::ProtocolError> for CoreError {
    fn from(err: palisade_proto::ProtocolError) -> Self {
        match err {
            palisade_proto::ProtocolError::Truncated { .. } => Self::Truncated(err.to_string()),
            palisade_proto::ProtocolError::Malformed(_)
            | palisade_proto::ProtocolError::MalformedBlock(_) => Self::Malformed(err.to_string()),
            palisade_proto::ProtocolError::PayloadTooLarge { .. } => {
                Self::PayloadTooLarge(err.to_string())
            },
        }
    }
}

impl From<palisade_crypto::CryptoError> for CoreError {
    fn from(err: palisade_crypto::CryptoError) -> Self {
        match err {
            palisade_crypto::CryptoError::KeyNotReady => Self::EncryptionNotReady,
            palisade_crypto::CryptoError::AuthenticationFailed => {
                Self::DecryptionError(err.to_string())
            },
            palisade_crypto::CryptoError::KeyAlreadyDerived
            | palisade_crypto::CryptoError::InvalidPublicKeyLength(_)
            | palisade_crypto::CryptoError::Malformed(_) => {
                Self::AuthenticationFailed(err.to_string())
            },
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => Self::SocketClosed,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Self::ReadError(err.to_string())
            },
            _ => Self::ReadError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_timeout_are_transient() {
        assert!(CoreError::RateLimited.is_transient());
        assert!(CoreError::HandlerTimeout { elapsed_ms: 50 }.is_transient());
        assert!(CoreError::Canceled.is_transient());
    }

    #[test]
    fn protocol_and_policy_failures_are_not_transient() {
        assert!(!CoreError::UnknownOpCode(0x1234).is_transient());
        assert!(!CoreError::PermissionDenied(0x1234).is_transient());
        assert!(!CoreError::Disposed.is_transient());
        assert!(!CoreError::Malformed("bad".into()).is_transient());
    }

    #[test]
    fn protocol_error_maps_by_kind() {
        let err: CoreError = palisade_proto::ProtocolError::Truncated { expected: 22, actual: 5 }.into();
        assert!(matches!(err, CoreError::Truncated(_)));

        let err: CoreError = palisade_proto::ProtocolError::PayloadTooLarge { size: 1, max: 0 }.into();
        assert!(matches!(err, CoreError::PayloadTooLarge(_)));
    }

    #[test]
    fn crypto_key_not_ready_maps_to_encryption_not_ready() {
        let err: CoreError = palisade_crypto::CryptoError::KeyNotReady.into();
        assert_eq!(err, CoreError::EncryptionNotReady);
    }
}
