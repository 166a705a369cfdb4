//! Control-plane wire protocol.
//!
//! Every frame is a JSON object tagged by `type`. Field names are camelCase.
//!
//! | Direction | Events |
//! |-----------|--------|
//! | client → server | `join`, `requestControl`, `releaseControl`, `withdrawControl`, `collabAllow`, `collabOccupy`, `collabVacate`, `snapshot`, `signal`, `ping` |
//! | server → client | `joined`, `granted`, `cleared`, `queueUpdated`, `presence`, `collab:allow`, `collab:close`, `collabOccupied`, `signal`, `snapshot`, `rejected`, `pong` |
//!
//! The secondary-slot side channel carries [`SideChannelMessage`] over the
//! media transport's reliable data channel using the same `collab:*` tags.

use crate::error::ProtocolError;
use crate::types::{ChannelId, ParticipantId};
use serde::{Deserialize, Serialize};

/// Maximum accepted frame size (64KB). Larger frames are rejected before parsing.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Events sent from a participant to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Join a channel. One membership per connection.
    Join {
        channel_id: ChannelId,
        /// Pre-validated identity string.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
        /// Bearer token whose subject claim names the participant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Ask for the primary slot.
    RequestControl { channel_id: ChannelId },
    /// Give up the primary slot.
    ReleaseControl { channel_id: ChannelId },
    /// Leave the wait queue without disconnecting.
    WithdrawControl { channel_id: ChannelId },
    /// Holder opens or closes the secondary slot.
    CollabAllow { channel_id: ChannelId, allowed: bool },
    /// Take the open secondary slot.
    CollabOccupy { channel_id: ChannelId },
    /// Leave the secondary slot.
    CollabVacate { channel_id: ChannelId },
    /// Ask for a consistent view of the channel.
    Snapshot { channel_id: ChannelId },
    /// Relay a negotiation payload to another member.
    Signal {
        channel_id: ChannelId,
        to_identity: ParticipantId,
        payload: serde_json::Value,
    },
    /// Keep-alive.
    Ping,
}

impl ClientEvent {
    /// Returns the wire name of the event, used for logging and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::RequestControl { .. } => "requestControl",
            ClientEvent::ReleaseControl { .. } => "releaseControl",
            ClientEvent::WithdrawControl { .. } => "withdrawControl",
            ClientEvent::CollabAllow { .. } => "collabAllow",
            ClientEvent::CollabOccupy { .. } => "collabOccupy",
            ClientEvent::CollabVacate { .. } => "collabVacate",
            ClientEvent::Snapshot { .. } => "snapshot",
            ClientEvent::Signal { .. } => "signal",
            ClientEvent::Ping => "ping",
        }
    }

    /// Returns the channel the event addresses, if any.
    #[must_use]
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            ClientEvent::Join { channel_id, .. }
            | ClientEvent::RequestControl { channel_id }
            | ClientEvent::ReleaseControl { channel_id }
            | ClientEvent::WithdrawControl { channel_id }
            | ClientEvent::CollabAllow { channel_id, .. }
            | ClientEvent::CollabOccupy { channel_id }
            | ClientEvent::CollabVacate { channel_id }
            | ClientEvent::Snapshot { channel_id }
            | ClientEvent::Signal { channel_id, .. } => Some(channel_id),
            ClientEvent::Ping => None,
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` before parsing oversized input, or `Malformed`
    /// if the frame is not a known event.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        decode_frame(frame)
    }
}

/// Presence change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceKind {
    /// A participant joined the channel.
    Join,
    /// A participant left or disconnected.
    Leave,
}

/// Consistent point-in-time view of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    /// Channel name.
    pub channel_id: Option<ChannelId>,
    /// Current primary-slot holder.
    pub holder: Option<ParticipantId>,
    /// Wait queue, head first.
    pub queue: Vec<ParticipantId>,
    /// Whether the holder has opened the secondary slot.
    pub collab_allowed: bool,
    /// Current secondary-slot occupant.
    pub collab_occupant: Option<ParticipantId>,
    /// Current members, in join order.
    pub members: Vec<ParticipantId>,
}

impl ChannelSnapshot {
    /// Number of waiting participants.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }
}

/// Events sent from the server to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Join accepted; sent to the joiner only.
    Joined {
        channel_id: ChannelId,
        identity: ParticipantId,
        holder: Option<ParticipantId>,
        queue_length: usize,
        queue: Vec<ParticipantId>,
        collab_allowed: bool,
        collab_occupant: Option<ParticipantId>,
    },
    /// New primary holder.
    Granted { identity: ParticipantId },
    /// Primary slot is now empty.
    Cleared,
    /// Current wait order.
    QueueUpdated { queue: Vec<ParticipantId> },
    /// Membership change.
    Presence {
        identity: ParticipantId,
        kind: PresenceKind,
    },
    /// Secondary slot opened or closed by the holder.
    #[serde(rename = "collab:allow")]
    CollabAllow { allowed: bool },
    /// Secondary slot force-closed; the occupant must tear down its attachment.
    #[serde(rename = "collab:close")]
    CollabClose,
    /// Secondary slot occupant changed.
    CollabOccupied { identity: Option<ParticipantId> },
    /// Relayed negotiation payload.
    Signal {
        from_identity: ParticipantId,
        payload: serde_json::Value,
    },
    /// Reply to a `snapshot` request.
    Snapshot(ChannelSnapshot),
    /// An action was refused; sent to the requester only.
    Rejected {
        action: String,
        code: i32,
        reason: String,
    },
    /// Keep-alive reply.
    Pong,
}

impl ServerEvent {
    /// Returns the wire name of the event, used for logging and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::Granted { .. } => "granted",
            ServerEvent::Cleared => "cleared",
            ServerEvent::QueueUpdated { .. } => "queueUpdated",
            ServerEvent::Presence { .. } => "presence",
            ServerEvent::CollabAllow { .. } => "collab:allow",
            ServerEvent::CollabClose => "collab:close",
            ServerEvent::CollabOccupied { .. } => "collabOccupied",
            ServerEvent::Signal { .. } => "signal",
            ServerEvent::Snapshot(_) => "snapshot",
            ServerEvent::Rejected { .. } => "rejected",
            ServerEvent::Pong => "pong",
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` or `Malformed`.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        decode_frame(frame)
    }
}

/// Secondary-slot control messages carried over the media data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SideChannelMessage {
    /// Holder opened or closed the secondary slot.
    #[serde(rename = "collab:allow")]
    Allow { allowed: bool },
    /// Holder force-closed the secondary slot.
    #[serde(rename = "collab:close")]
    Close,
}

impl SideChannelMessage {
    /// Encode as UTF-8 JSON bytes for the data channel.
    ///
    /// # Errors
    ///
    /// Returns `Encode` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a data channel payload.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` or `Malformed`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(bytes.len()));
        }
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Encode any protocol value as a JSON text frame.
///
/// # Errors
///
/// Returns `Encode` if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode_frame<T: for<'de> Deserialize<'de>>(frame: &str) -> Result<T, ProtocolError> {
    // Check size first, before allocating anything for the parse
    if frame.len() > MAX_FRAME_BYTES {
        tracing::debug!(
            target: "common.protocol",
            frame_size = frame.len(),
            max_size = MAX_FRAME_BYTES,
            "Frame rejected: size exceeds maximum allowed"
        );
        return Err(ProtocolError::FrameTooLarge(frame.len()));
    }
    serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_join_with_identity() {
        let event =
            ClientEvent::decode(r#"{"type":"join","channelId":"demo","identity":"alice"}"#)
                .unwrap();
        assert_eq!(
            event,
            ClientEvent::Join {
                channel_id: ChannelId::new("demo"),
                identity: Some("alice".to_string()),
                token: None,
            }
        );
        assert_eq!(event.name(), "join");
    }

    #[test]
    fn test_decode_signal_keeps_payload_opaque() {
        let frame = json!({
            "type": "signal",
            "channelId": "demo",
            "toIdentity": "bob",
            "payload": {"offer": {"sdp": "v=0"}}
        })
        .to_string();
        let event = ClientEvent::decode(&frame).unwrap();
        match event {
            ClientEvent::Signal {
                to_identity,
                payload,
                ..
            } => {
                assert_eq!(to_identity.as_str(), "bob");
                assert_eq!(payload["offer"]["sdp"], "v=0");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let result = ClientEvent::decode(r#"{"type":"takeOver","channelId":"demo"}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_empty_channel() {
        let result = ClientEvent::decode(r#"{"type":"requestControl","channelId":""}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let frame = format!(
            r#"{{"type":"ping","pad":"{}"}}"#,
            "x".repeat(MAX_FRAME_BYTES)
        );
        assert!(matches!(
            ClientEvent::decode(&frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_server_event_wire_names() {
        assert_eq!(
            encode(&ServerEvent::CollabAllow { allowed: true }).unwrap(),
            r#"{"type":"collab:allow","allowed":true}"#
        );
        assert_eq!(
            encode(&ServerEvent::CollabClose).unwrap(),
            r#"{"type":"collab:close"}"#
        );
        assert_eq!(
            encode(&ServerEvent::Cleared).unwrap(),
            r#"{"type":"cleared"}"#
        );
        let queue = encode(&ServerEvent::QueueUpdated {
            queue: vec![ParticipantId::new("b"), ParticipantId::new("c")],
        })
        .unwrap();
        assert_eq!(queue, r#"{"type":"queueUpdated","queue":["b","c"]}"#);
    }

    #[test]
    fn test_presence_and_signal_field_names() {
        let presence = serde_json::to_value(ServerEvent::Presence {
            identity: ParticipantId::new("a"),
            kind: PresenceKind::Leave,
        })
        .unwrap();
        assert_eq!(
            presence,
            json!({"type": "presence", "identity": "a", "kind": "leave"})
        );

        let signal = serde_json::to_value(ServerEvent::Signal {
            from_identity: ParticipantId::new("a"),
            payload: json!({"candidate": "c1"}),
        })
        .unwrap();
        assert_eq!(signal["fromIdentity"], "a");
    }

    #[test]
    fn test_snapshot_event_flattens_fields() {
        let snapshot = ChannelSnapshot {
            channel_id: Some(ChannelId::new("demo")),
            holder: Some(ParticipantId::new("a")),
            queue: vec![ParticipantId::new("b")],
            collab_allowed: false,
            collab_occupant: None,
            members: vec![ParticipantId::new("a"), ParticipantId::new("b")],
        };
        let value = serde_json::to_value(ServerEvent::Snapshot(snapshot.clone())).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["holder"], "a");
        assert_eq!(value["collabAllowed"], false);

        let decoded = ServerEvent::decode(&value.to_string()).unwrap();
        assert_eq!(decoded, ServerEvent::Snapshot(snapshot));
    }

    #[test]
    fn test_side_channel_message_matches_data_channel_format() {
        let bytes = SideChannelMessage::Allow { allowed: false }
            .to_bytes()
            .unwrap();
        assert_eq!(bytes, br#"{"type":"collab:allow","allowed":false}"#.to_vec());
        assert_eq!(
            SideChannelMessage::from_bytes(br#"{"type":"collab:close"}"#).unwrap(),
            SideChannelMessage::Close
        );
        assert!(SideChannelMessage::from_bytes(b"not json").is_err());
    }
}
