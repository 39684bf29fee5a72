//! Error types for the bridge wire runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding, or moving bridge traffic.
#[derive(Debug, Error)]
pub enum Error {
    /// A value outside the wire algebra was encountered during serialization.
    #[error("Unexpected value: {0}")]
    Unencodable(String),

    /// An evaluate source that fits neither the expression nor the
    /// method-shorthand form.
    #[error("Passed function is not well-serializable: {0}")]
    NotWellSerializable(String),

    /// Malformed or out-of-contract message traffic.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Handle id not present in the supplied target vector.
    #[error("Unknown handle id: {0}")]
    UnknownHandle(u32),

    /// The underlying channel is gone.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level error (socket establishment or I/O).
    #[error("Transport error: {0}")]
    Transport(String),
}
