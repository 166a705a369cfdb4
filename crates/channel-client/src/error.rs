//! Client error types.

use common::error::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the control client and participant driver.
///
/// Local pre-check failures (`NotHolder`, `AlreadyHolder`, `CollabClosed`,
/// `CollabOccupied`, `NotOccupant`, `NoHolder`) are raised before anything
/// is sent to the server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server rejected {action} (code {code}): {reason}")]
    Rejected {
        action: String,
        code: i32,
        reason: String,
    },

    #[error("Media session error: {0}")]
    Media(String),

    #[error("Only the aux holder can do that")]
    NotHolder,

    #[error("You already have the aux")]
    AlreadyHolder,

    #[error("Collab is closed")]
    CollabClosed,

    #[error("Collab slot is occupied")]
    CollabOccupied,

    #[error("You are not in the collab slot")]
    NotOccupant,

    #[error("No one holds the aux")]
    NoHolder,
}

impl ClientError {
    /// Returns true when the error came from a local pre-check rather than
    /// the server or the transport.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ClientError::NotHolder
                | ClientError::AlreadyHolder
                | ClientError::CollabClosed
                | ClientError::CollabOccupied
                | ClientError::NotOccupant
                | ClientError::NoHolder
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        assert!(ClientError::CollabClosed.is_precondition());
        assert!(ClientError::NoHolder.is_precondition());
        assert!(!ClientError::Closed.is_precondition());
        assert!(!ClientError::Rejected {
            action: "requestControl".to_string(),
            code: 3,
            reason: "forbidden".to_string(),
        }
        .is_precondition());
    }

    #[test]
    fn test_rejected_display_names_action_and_code() {
        let err = ClientError::Rejected {
            action: "collabAllow".to_string(),
            code: 3,
            reason: "Only the holder can change the collab slot".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("collabAllow"));
        assert!(text.contains("code 3"));
    }
}
