//! Channel Controller error types.
//!
//! Every error maps to a stable rejection code sent to the requester in a
//! `rejected` event. Internal details are logged server-side but never
//! exposed to clients.

use crate::arbiter::ArbiterError;
use common::error::ProtocolError;
use common::identity::IdentityError;
use thiserror::Error;

/// Channel Controller error type.
///
/// Maps to rejection codes:
/// - `Protocol`, `ChannelMismatch`: `BAD_REQUEST` (1)
/// - `Identity`, `NotJoined`: `UNAUTHORIZED` (2)
/// - `Arbiter`: code of the underlying rejection (3, 4, 5 or 7)
/// - `AlreadyJoined`: `CONFLICT` (5)
/// - `Internal`: `INTERNAL_ERROR` (6)
/// - `ChannelClosed`, `CapacityExceeded`, `Draining`: `UNAVAILABLE` (7)
#[derive(Debug, Error)]
pub enum CcError {
    /// Frame could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Join carried no usable identity.
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// The channel refused the operation.
    #[error("Rejected: {0}")]
    Arbiter(#[from] ArbiterError),

    /// Operation requires a prior join on this connection.
    #[error("Connection has not joined a channel")]
    NotJoined,

    /// Connection already holds a channel membership.
    #[error("Connection already joined a channel")]
    AlreadyJoined,

    /// Event addressed a channel other than the joined one.
    #[error("Channel mismatch")]
    ChannelMismatch,

    /// Channel actor has closed; a fresh one must be created.
    #[error("Channel closed")]
    ChannelClosed,

    /// Controller is at its channel limit.
    #[error("Controller at capacity")]
    CapacityExceeded,

    /// Controller is draining (graceful shutdown).
    #[error("Controller is draining")]
    Draining,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CcError {
    /// Returns the rejection code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            CcError::Protocol(_) | CcError::ChannelMismatch => 1, // BAD_REQUEST
            CcError::Identity(_) | CcError::NotJoined => 2,       // UNAUTHORIZED
            CcError::Arbiter(e) => e.error_code(),
            CcError::AlreadyJoined => 5,                          // CONFLICT
            CcError::Internal(_) => 6,                            // INTERNAL_ERROR
            CcError::ChannelClosed | CcError::CapacityExceeded | CcError::Draining => 7, // UNAVAILABLE
        }
    }

    /// Returns a client-safe message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CcError::Protocol(ProtocolError::FrameTooLarge(_)) => "frame_too_large".to_string(),
            CcError::Protocol(_) => "malformed_frame".to_string(),
            CcError::Identity(_) => "no_identity".to_string(),
            CcError::Arbiter(e) => e.reason().to_string(),
            CcError::NotJoined => "not_joined".to_string(),
            CcError::AlreadyJoined => "already_joined".to_string(),
            CcError::ChannelMismatch => "channel_mismatch".to_string(),
            CcError::ChannelClosed => "channel_closed".to_string(),
            CcError::CapacityExceeded => "capacity_exceeded".to_string(),
            CcError::Draining => "draining".to_string(),
            CcError::Internal(_) => "internal_error".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        // Caller errors
        assert_eq!(
            CcError::Protocol(ProtocolError::Malformed("x".to_string())).error_code(),
            1
        );
        assert_eq!(CcError::ChannelMismatch.error_code(), 1);
        assert_eq!(CcError::Identity(IdentityError::Missing).error_code(), 2);
        assert_eq!(CcError::NotJoined.error_code(), 2);

        // Permission errors carry the arbiter code
        assert_eq!(CcError::Arbiter(ArbiterError::NotHolder).error_code(), 3);
        assert_eq!(CcError::Arbiter(ArbiterError::AlreadyMember).error_code(), 5);

        assert_eq!(CcError::Arbiter(ArbiterError::NotMember).error_code(), 4);
        assert_eq!(CcError::AlreadyJoined.error_code(), 5);
        assert_eq!(CcError::Internal("boom".to_string()).error_code(), 6);
        assert_eq!(CcError::ChannelClosed.error_code(), 7);
        assert_eq!(CcError::CapacityExceeded.error_code(), 7);
        assert_eq!(CcError::Draining.error_code(), 7);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let internal = CcError::Internal("mailbox for channel secret-room closed".to_string());
        assert_eq!(internal.client_message(), "internal_error");
        assert!(!internal.client_message().contains("secret-room"));
    }

    #[test]
    fn test_client_message_uses_arbiter_reason() {
        assert_eq!(
            CcError::Arbiter(ArbiterError::AlreadyHolder).client_message(),
            "already_holder"
        );
        assert_eq!(
            CcError::Protocol(ProtocolError::FrameTooLarge(70_000)).client_message(),
            "frame_too_large"
        );
    }

    #[test]
    fn test_from_conversions() {
        let err: CcError = ArbiterError::CollabOccupied.into();
        assert!(matches!(err, CcError::Arbiter(ArbiterError::CollabOccupied)));

        let err: CcError = IdentityError::MalformedToken.into();
        assert!(matches!(err, CcError::Identity(_)));
    }
}
