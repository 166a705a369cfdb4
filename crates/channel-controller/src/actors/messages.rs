//! Message types for actor communication.
//!
//! Request-reply messages carry a `oneshot` responder. Everything a channel
//! actor sends to a connection is fire-and-forget.

use crate::arbiter::{ArbiterError, ChannelState, Transition};
use crate::errors::CcError;

use super::channel::ChannelActorHandle;
use super::connection::ConnectionActorHandle;

use common::protocol::ServerEvent;
use common::types::{ChannelId, ParticipantId};
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `ChannelRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Look up a channel, creating it on first use.
    GetOrCreate {
        channel_id: ChannelId,
        respond_to: oneshot::Sender<Result<ChannelActorHandle, CcError>>,
    },

    /// A member left the channel; close and drop it if it is now empty.
    ChannelVacated { channel_id: ChannelId },

    /// Current registry status.
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting channels and cancel the tree.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), CcError>>,
    },
}

/// Registry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub channel_count: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Messages sent to `ChannelActor`.
#[derive(Debug)]
pub enum ChannelMessage {
    /// Register a member and attach its outbound connection.
    Join {
        participant: ParticipantId,
        connection: ConnectionActorHandle,
        respond_to: oneshot::Sender<Result<(), CcError>>,
    },

    /// Remove a member (explicit leave or disconnect).
    Leave {
        participant: ParticipantId,
        respond_to: oneshot::Sender<()>,
    },

    /// Apply an arbitration command on behalf of a member.
    Command {
        participant: ParticipantId,
        command: ChannelCommand,
        respond_to: oneshot::Sender<Result<(), CcError>>,
    },

    /// Forward a negotiation payload to another member.
    Relay {
        from: ParticipantId,
        to: ParticipantId,
        payload: serde_json::Value,
    },

    /// Close if no members remain. Replies whether the channel closed.
    TryClose { respond_to: oneshot::Sender<bool> },
}

/// Arbitration commands a member can issue after joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    RequestControl,
    ReleaseControl,
    WithdrawControl,
    SetCollabAllowed(bool),
    OccupyCollab,
    VacateCollab,
}

impl ChannelCommand {
    /// Wire name of the client event that carries this command.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            ChannelCommand::RequestControl => "requestControl",
            ChannelCommand::ReleaseControl => "releaseControl",
            ChannelCommand::WithdrawControl => "withdrawControl",
            ChannelCommand::SetCollabAllowed(_) => "collabAllow",
            ChannelCommand::OccupyCollab => "collabOccupy",
            ChannelCommand::VacateCollab => "collabVacate",
        }
    }

    /// Apply the command to the channel state.
    ///
    /// # Errors
    ///
    /// Returns the arbiter's rejection; state is unchanged on error.
    pub fn apply(
        self,
        state: &mut ChannelState,
        participant: &ParticipantId,
    ) -> Result<Transition, ArbiterError> {
        match self {
            ChannelCommand::RequestControl => state.request_control(participant),
            ChannelCommand::ReleaseControl => state.release_control(participant),
            ChannelCommand::WithdrawControl => state.withdraw_control(participant),
            ChannelCommand::SetCollabAllowed(allowed) => {
                state.set_collab_allowed(participant, allowed)
            }
            ChannelCommand::OccupyCollab => state.occupy_collab(participant),
            ChannelCommand::VacateCollab => state.vacate_collab(participant),
        }
    }
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write an event to the socket.
    Deliver { event: ServerEvent },

    /// Send a close frame and stop.
    Close { reason: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_command_actions_match_client_event_names() {
        use common::protocol::ClientEvent;

        let channel_id = ChannelId::new("demo");
        let pairs = [
            (
                ChannelCommand::RequestControl,
                ClientEvent::RequestControl {
                    channel_id: channel_id.clone(),
                },
            ),
            (
                ChannelCommand::SetCollabAllowed(true),
                ClientEvent::CollabAllow {
                    channel_id: channel_id.clone(),
                    allowed: true,
                },
            ),
            (
                ChannelCommand::VacateCollab,
                ClientEvent::CollabVacate { channel_id },
            ),
        ];

        for (command, event) in pairs {
            assert_eq!(command.action(), event.name());
        }
    }

    #[test]
    fn test_command_apply_routes_to_state() {
        let mut state = ChannelState::new(ChannelId::new("demo"), 8);
        let alice = ParticipantId::new("alice");
        state.join(&alice).unwrap();

        ChannelCommand::RequestControl
            .apply(&mut state, &alice)
            .unwrap();
        assert_eq!(state.holder(), Some(&alice));

        let err = ChannelCommand::OccupyCollab
            .apply(&mut state, &alice)
            .unwrap_err();
        assert_eq!(err, ArbiterError::HolderCannotOccupy);
    }
}
