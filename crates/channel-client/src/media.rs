//! Media transport seam.
//!
//! The control plane never carries media. A participant publishes named
//! attachments (`aux`, `collab`) and side-channel bytes through whatever
//! media transport it is connected to, and learns about everyone else's
//! attachments from the same session's event stream.

use crate::error::ClientError;
use common::types::{AttachmentLabel, ParticipantId};

/// Notification from the media transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// A remote participant connected to the media room.
    ParticipantJoined(ParticipantId),
    /// A remote participant left; all of its attachments are gone.
    ParticipantLeft(ParticipantId),
    /// A participant published a named attachment.
    AttachmentAdded {
        participant: ParticipantId,
        label: AttachmentLabel,
    },
    /// A participant withdrew a named attachment.
    AttachmentRemoved {
        participant: ParticipantId,
        label: AttachmentLabel,
    },
    /// Reliable data-channel payload from another participant.
    Data {
        from: ParticipantId,
        payload: Vec<u8>,
    },
}

/// Operations a participant needs from the media transport.
///
/// Implementations deliver events for remote participants only; local
/// publish and unpublish calls are reflected by the caller.
#[async_trait::async_trait]
pub trait MediaSession: Send + Sync {
    /// Identity this session is connected as.
    fn identity(&self) -> &ParticipantId;

    /// Publish a named attachment.
    async fn publish(&self, label: AttachmentLabel) -> Result<(), ClientError>;

    /// Withdraw a named attachment. Withdrawing an attachment that is not
    /// published is a no-op.
    async fn unpublish(&self, label: AttachmentLabel) -> Result<(), ClientError>;

    /// Send bytes to every other participant over the reliable data channel.
    async fn publish_data(&self, payload: Vec<u8>) -> Result<(), ClientError>;

    /// Wait for the next notification. Returns `None` once the session is
    /// closed.
    async fn next_event(&self) -> Option<MediaEvent>;
}
