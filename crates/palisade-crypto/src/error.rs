//! Error types for key exchange and AEAD sealing.

use thiserror::Error;

/// Failures from session key derivation and message sealing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// An encrypt/decrypt call was made before
    /// [`crate::SecurityManager::derive_session_key`] completed.
    #[error("session key has not been derived yet")]
    KeyNotReady,

    /// `derive_session_key` was called a second time on the same
    /// [`crate::SecurityManager`].
    #[error("session key was already derived")]
    KeyAlreadyDerived,

    /// Peer-supplied public key was not 32 bytes.
    #[error("public key must be 32 bytes, got {0}")]
    InvalidPublicKeyLength(usize),

    /// Ciphertext shorter than `nonce(12) + tag(16)`.
    #[error("ciphertext too short: {0} bytes, need at least 28")]
    Malformed(usize),

    /// AEAD tag verification failed.
    #[error("authentication tag mismatch")]
    AuthenticationFailed,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CryptoError>;
