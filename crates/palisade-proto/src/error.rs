//! Error types for packet framing and the LZ4 block engine.
//!
//! Codec failures are always represented as `Result`, never a panic — callers
//! on the receive path are handling bytes from an untrusted peer.

use thiserror::Error;

/// Failures from packet encoding/decoding and LZ4 (de)compression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer shorter than `HEADER_SIZE`, or `Length` claims more bytes than
    /// are actually present.
    #[error("truncated frame: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum bytes required to proceed.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Header fields parsed but are structurally inconsistent (e.g. `Length`
    /// below `HEADER_SIZE`).
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Payload length does not fit in `u16`.
    #[error("payload too large: {size} bytes exceeds max {max}")]
    PayloadTooLarge {
        /// Payload size that was rejected.
        size: usize,
        /// Maximum payload size (`u16::MAX`).
        max: usize,
    },

    /// LZ4 stream header or body could not be parsed.
    #[error("malformed lz4 block: {0}")]
    MalformedBlock(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;
