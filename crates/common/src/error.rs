//! Common error types for Audio Arcade components.

use thiserror::Error;

/// Errors raised while encoding or decoding control-plane frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame exceeds the maximum accepted size.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame is not a recognizable event.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Event could not be serialized.
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// An identifier failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidIdError {
    /// Identifier is empty or whitespace only.
    #[error("identifier must not be empty")]
    Empty,

    /// Identifier exceeds the maximum length.
    #[error("identifier exceeds {max} bytes")]
    TooLong {
        /// Maximum permitted length in bytes.
        max: usize,
    },

    /// Identifier contains control characters.
    #[error("identifier contains control characters")]
    ControlCharacters,
}

/// Result type alias using `ProtocolError`
pub type Result<T> = std::result::Result<T, ProtocolError>;
