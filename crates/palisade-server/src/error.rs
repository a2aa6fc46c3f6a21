//! Top-level server error, wrapping [`palisade_core::CoreError`] plus the
//! failure modes specific to running the runtime (bind/config/accept).

use thiserror::Error;

/// Errors surfaced by the server binary and its connection-handling tasks.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration failed validation before the server could start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Binding the listener or accepting a connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Error surfaced by the connection/dispatcher core.
    #[error(transparent)]
    Core(#[from] palisade_core::CoreError),
}
