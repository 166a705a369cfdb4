//! Channel arbitration state machine.
//!
//! `ChannelState` is the authoritative record for one channel: its members,
//! the primary-slot holder, the FIFO wait queue and the secondary slot. It is
//! pure and synchronous. The owning `ChannelActor` applies one operation at a
//! time and fans the resulting events out to members.
//!
//! # Invariants
//!
//! - The holder is never queued and the queue has no duplicates.
//! - The secondary occupant is never the holder.
//! - A closed secondary slot has no occupant.
//! - An open secondary slot implies a holder.
//! - Holder, queue entries and occupant are all current members.
//!
//! # Holder changes
//!
//! Whenever a holder gives up the slot (release or leave) the secondary slot
//! is force-closed first: `collab:allow{false}` and `collab:close` are emitted
//! ahead of the `granted`/`cleared` that announces the new holder.

use common::protocol::{ChannelSnapshot, PresenceKind, ServerEvent};
use common::types::{ChannelId, ParticipantId};
use std::collections::VecDeque;
use thiserror::Error;

/// An operation was refused. State is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArbiterError {
    /// Requester is not a member of the channel.
    #[error("not a channel member")]
    NotMember,

    /// Identity is already joined to the channel.
    #[error("already a channel member")]
    AlreadyMember,

    /// Channel has reached its member limit.
    #[error("channel is full")]
    ChannelFull,

    /// Requester already holds the primary slot.
    #[error("already holding control")]
    AlreadyHolder,

    /// Operation requires holding the primary slot.
    #[error("not holding control")]
    NotHolder,

    /// Secondary slot is closed.
    #[error("collaboration is not allowed")]
    CollabNotAllowed,

    /// Secondary slot already has an occupant.
    #[error("collaboration slot is occupied")]
    CollabOccupied,

    /// The holder cannot also occupy the secondary slot.
    #[error("holder cannot occupy the collaboration slot")]
    HolderCannotOccupy,

    /// Requester does not occupy the secondary slot.
    #[error("not occupying the collaboration slot")]
    NotOccupant,
}

impl ArbiterError {
    /// Stable machine-readable reason, sent to the requester.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            ArbiterError::NotMember => "not_member",
            ArbiterError::AlreadyMember => "already_member",
            ArbiterError::ChannelFull => "channel_full",
            ArbiterError::AlreadyHolder => "already_holder",
            ArbiterError::NotHolder => "not_holder",
            ArbiterError::CollabNotAllowed => "collab_not_allowed",
            ArbiterError::CollabOccupied => "collab_occupied",
            ArbiterError::HolderCannotOccupy => "holder_cannot_occupy",
            ArbiterError::NotOccupant => "not_occupant",
        }
    }

    /// Rejection code for the wire.
    #[must_use]
    pub const fn error_code(&self) -> i32 {
        match self {
            ArbiterError::NotMember => 4,     // NOT_FOUND
            ArbiterError::AlreadyMember => 5, // CONFLICT
            ArbiterError::ChannelFull => 7,   // UNAVAILABLE
            ArbiterError::AlreadyHolder
            | ArbiterError::NotHolder
            | ArbiterError::CollabNotAllowed
            | ArbiterError::CollabOccupied
            | ArbiterError::HolderCannotOccupy
            | ArbiterError::NotOccupant => 3, // FORBIDDEN
        }
    }
}

/// Why the primary slot was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantReason {
    /// Granted straight away to a requester on an idle channel.
    Request,
    /// Handed to the queue head after the holder released.
    Release,
    /// Handed to the queue head after the holder left or disconnected.
    Disconnect,
}

impl GrantReason {
    /// Returns the reason as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            GrantReason::Request => "request",
            GrantReason::Release => "release",
            GrantReason::Disconnect => "disconnect",
        }
    }
}

/// Secondary ("collab") slot record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecondarySlot {
    /// Whether the holder has opened the slot.
    pub allowed: bool,
    /// Current occupant.
    pub occupant: Option<ParticipantId>,
}

/// Result of one committed operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    /// Event for the requester only, delivered before any broadcast.
    pub reply: Option<ServerEvent>,
    /// Events for every member, in commit order.
    pub broadcast: Vec<ServerEvent>,
    /// Set when the operation granted the primary slot.
    pub granted: Option<GrantReason>,
}

impl Transition {
    /// True when the operation changed nothing observable.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.reply.is_none() && self.broadcast.is_empty()
    }
}

/// Authoritative state for one channel.
#[derive(Debug, Clone)]
pub struct ChannelState {
    channel_id: ChannelId,
    max_members: usize,
    members: Vec<ParticipantId>,
    holder: Option<ParticipantId>,
    queue: VecDeque<ParticipantId>,
    secondary: SecondarySlot,
}

impl ChannelState {
    /// Create an empty channel.
    #[must_use]
    pub fn new(channel_id: ChannelId, max_members: usize) -> Self {
        Self {
            channel_id,
            max_members,
            members: Vec::new(),
            holder: None,
            queue: VecDeque::new(),
            secondary: SecondarySlot::default(),
        }
    }

    #[must_use]
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    #[must_use]
    pub fn holder(&self) -> Option<&ParticipantId> {
        self.holder.as_ref()
    }

    #[must_use]
    pub fn queue(&self) -> &VecDeque<ParticipantId> {
        &self.queue
    }

    #[must_use]
    pub fn secondary(&self) -> &SecondarySlot {
        &self.secondary
    }

    /// Members in join order.
    #[must_use]
    pub fn members(&self) -> &[ParticipantId] {
        &self.members
    }

    #[must_use]
    pub fn is_member(&self, participant: &ParticipantId) -> bool {
        self.members.contains(participant)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Consistent view of the whole channel.
    #[must_use]
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: Some(self.channel_id.clone()),
            holder: self.holder.clone(),
            queue: self.queue_vec(),
            collab_allowed: self.secondary.allowed,
            collab_occupant: self.secondary.occupant.clone(),
            members: self.members.clone(),
        }
    }

    /// Register a member.
    ///
    /// The joiner receives `joined` with the current holder and queue, then
    /// every member (joiner included) receives `presence{join}`.
    ///
    /// # Errors
    ///
    /// `AlreadyMember` for a duplicate identity, `ChannelFull` at the member limit.
    pub fn join(&mut self, participant: &ParticipantId) -> Result<Transition, ArbiterError> {
        if self.is_member(participant) {
            return Err(ArbiterError::AlreadyMember);
        }
        if self.members.len() >= self.max_members {
            return Err(ArbiterError::ChannelFull);
        }

        self.members.push(participant.clone());

        let reply = ServerEvent::Joined {
            channel_id: self.channel_id.clone(),
            identity: participant.clone(),
            holder: self.holder.clone(),
            queue_length: self.queue.len(),
            queue: self.queue_vec(),
            collab_allowed: self.secondary.allowed,
            collab_occupant: self.secondary.occupant.clone(),
        };

        Ok(Transition {
            reply: Some(reply),
            broadcast: vec![ServerEvent::Presence {
                identity: participant.clone(),
                kind: PresenceKind::Join,
            }],
            granted: None,
        })
    }

    /// Ask for the primary slot.
    ///
    /// Grants immediately on an idle channel, otherwise appends to the queue.
    /// A repeat request from a queued member changes nothing.
    ///
    /// # Errors
    ///
    /// `NotMember`, or `AlreadyHolder` when the holder asks again.
    pub fn request_control(
        &mut self,
        participant: &ParticipantId,
    ) -> Result<Transition, ArbiterError> {
        self.ensure_member(participant)?;

        match &self.holder {
            None => {
                self.holder = Some(participant.clone());
                self.debug_check();
                Ok(Transition {
                    reply: None,
                    broadcast: vec![ServerEvent::Granted {
                        identity: participant.clone(),
                    }],
                    granted: Some(GrantReason::Request),
                })
            }
            Some(holder) if holder == participant => Err(ArbiterError::AlreadyHolder),
            Some(_) if self.queue.contains(participant) => Ok(Transition::default()),
            Some(_) => {
                self.queue.push_back(participant.clone());
                self.debug_check();
                Ok(Transition {
                    reply: None,
                    broadcast: vec![ServerEvent::QueueUpdated {
                        queue: self.queue_vec(),
                    }],
                    granted: None,
                })
            }
        }
    }

    /// Give up the primary slot. The queue head, if any, becomes holder.
    ///
    /// # Errors
    ///
    /// `NotMember`, or `NotHolder` if the requester does not hold the slot.
    pub fn release_control(
        &mut self,
        participant: &ParticipantId,
    ) -> Result<Transition, ArbiterError> {
        self.ensure_member(participant)?;
        if self.holder.as_ref() != Some(participant) {
            return Err(ArbiterError::NotHolder);
        }

        let mut broadcast = Vec::new();
        let granted = self.hand_over(GrantReason::Release, &mut broadcast);
        self.debug_check();

        Ok(Transition {
            reply: None,
            broadcast,
            granted,
        })
    }

    /// Leave the queue without disconnecting. No-op when not queued.
    ///
    /// # Errors
    ///
    /// `NotMember`.
    pub fn withdraw_control(
        &mut self,
        participant: &ParticipantId,
    ) -> Result<Transition, ArbiterError> {
        self.ensure_member(participant)?;
        if !self.remove_from_queue(participant) {
            return Ok(Transition::default());
        }

        self.debug_check();
        Ok(Transition {
            reply: None,
            broadcast: vec![ServerEvent::QueueUpdated {
                queue: self.queue_vec(),
            }],
            granted: None,
        })
    }

    /// Open or close the secondary slot. Closing evicts any occupant.
    ///
    /// # Errors
    ///
    /// `NotMember`, or `NotHolder` unless the requester holds the primary slot.
    pub fn set_collab_allowed(
        &mut self,
        participant: &ParticipantId,
        allowed: bool,
    ) -> Result<Transition, ArbiterError> {
        self.ensure_member(participant)?;
        if self.holder.as_ref() != Some(participant) {
            return Err(ArbiterError::NotHolder);
        }

        let mut broadcast = Vec::new();
        if allowed {
            self.secondary.allowed = true;
            broadcast.push(ServerEvent::CollabAllow { allowed: true });
        } else {
            self.close_secondary(&mut broadcast);
        }
        self.debug_check();

        Ok(Transition {
            reply: None,
            broadcast,
            granted: None,
        })
    }

    /// Take the open secondary slot.
    ///
    /// # Errors
    ///
    /// `NotMember`, `HolderCannotOccupy`, `CollabNotAllowed` or `CollabOccupied`.
    pub fn occupy_collab(&mut self, participant: &ParticipantId) -> Result<Transition, ArbiterError> {
        self.ensure_member(participant)?;
        if self.holder.as_ref() == Some(participant) {
            return Err(ArbiterError::HolderCannotOccupy);
        }
        if !self.secondary.allowed {
            return Err(ArbiterError::CollabNotAllowed);
        }
        if self.secondary.occupant.is_some() {
            return Err(ArbiterError::CollabOccupied);
        }

        self.secondary.occupant = Some(participant.clone());
        self.debug_check();

        Ok(Transition {
            reply: None,
            broadcast: vec![ServerEvent::CollabOccupied {
                identity: Some(participant.clone()),
            }],
            granted: None,
        })
    }

    /// Leave the secondary slot. The slot stays open.
    ///
    /// # Errors
    ///
    /// `NotMember` or `NotOccupant`.
    pub fn vacate_collab(&mut self, participant: &ParticipantId) -> Result<Transition, ArbiterError> {
        self.ensure_member(participant)?;
        if self.secondary.occupant.as_ref() != Some(participant) {
            return Err(ArbiterError::NotOccupant);
        }

        self.secondary.occupant = None;
        self.debug_check();

        Ok(Transition {
            reply: None,
            broadcast: vec![ServerEvent::CollabOccupied { identity: None }],
            granted: None,
        })
    }

    /// Remove a member, releasing everything it held.
    ///
    /// Disconnects and explicit leaves take this same path. Leaving twice is
    /// a no-op.
    pub fn leave(&mut self, participant: &ParticipantId) -> Transition {
        if !self.is_member(participant) {
            return Transition::default();
        }

        let mut broadcast = Vec::new();
        let mut granted = None;

        if self.holder.as_ref() == Some(participant) {
            granted = self.hand_over(GrantReason::Disconnect, &mut broadcast);
        } else if self.remove_from_queue(participant) {
            broadcast.push(ServerEvent::QueueUpdated {
                queue: self.queue_vec(),
            });
        }

        if self.secondary.occupant.as_ref() == Some(participant) {
            self.secondary.occupant = None;
            broadcast.push(ServerEvent::CollabOccupied { identity: None });
        }

        self.members.retain(|member| member != participant);
        broadcast.push(ServerEvent::Presence {
            identity: participant.clone(),
            kind: PresenceKind::Leave,
        });
        self.debug_check();

        Transition {
            reply: None,
            broadcast,
            granted,
        }
    }

    /// Pass the primary slot on from the current holder.
    fn hand_over(
        &mut self,
        reason: GrantReason,
        broadcast: &mut Vec<ServerEvent>,
    ) -> Option<GrantReason> {
        self.close_secondary(broadcast);

        self.holder = self.queue.pop_front();
        match &self.holder {
            Some(next) => {
                broadcast.push(ServerEvent::Granted {
                    identity: next.clone(),
                });
                broadcast.push(ServerEvent::QueueUpdated {
                    queue: self.queue_vec(),
                });
                Some(reason)
            }
            None => {
                broadcast.push(ServerEvent::Cleared);
                None
            }
        }
    }

    fn close_secondary(&mut self, broadcast: &mut Vec<ServerEvent>) {
        self.secondary.allowed = false;
        self.secondary.occupant = None;
        broadcast.push(ServerEvent::CollabAllow { allowed: false });
        broadcast.push(ServerEvent::CollabClose);
    }

    fn remove_from_queue(&mut self, participant: &ParticipantId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|queued| queued != participant);
        self.queue.len() != before
    }

    fn ensure_member(&self, participant: &ParticipantId) -> Result<(), ArbiterError> {
        if self.is_member(participant) {
            Ok(())
        } else {
            Err(ArbiterError::NotMember)
        }
    }

    fn queue_vec(&self) -> Vec<ParticipantId> {
        self.queue.iter().cloned().collect()
    }

    fn debug_check(&self) {
        debug_assert!(
            self.holder.as_ref().map_or(true, |h| !self.queue.contains(h)),
            "holder must not be queued"
        );
        debug_assert!(
            self.secondary.occupant.is_none() || self.secondary.occupant != self.holder,
            "occupant must not be the holder"
        );
        debug_assert!(
            self.secondary.allowed || self.secondary.occupant.is_none(),
            "closed slot must be empty"
        );
        debug_assert!(
            !self.secondary.allowed || self.holder.is_some(),
            "open slot requires a holder"
        );
    }
}
