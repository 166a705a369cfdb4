//! Participant driver.
//!
//! Wires one control connection, one media session and a [`SlotProjector`]
//! together and exposes the user actions of a channel screen. Actions run
//! local pre-checks against the projected view and fail without contacting
//! the server when those checks fail.
//!
//! The caller drives incoming traffic with [`ChannelParticipant::next_update`],
//! which applies each control or media event to the projector and carries
//! out whatever follows from it:
//!
//! - `granted` naming me after [`take_aux`](ChannelParticipant::take_aux):
//!   publish the primary attachment (a `snapshot` naming me counts as a
//!   grant I missed)
//! - `granted` naming me after [`withdraw`](ChannelParticipant::withdraw)
//!   already went out: the grant won the race, so release it straight away
//! - `collabOccupied` naming me after
//!   [`join_collab`](ChannelParticipant::join_collab): publish the secondary
//!   attachment
//! - `collab:close` while occupying: withdraw the secondary attachment

use crate::client::{ControlClient, JoinedChannel};
use crate::error::ClientError;
use crate::media::{MediaEvent, MediaSession};
use crate::projector::{ProjectorEffect, ProjectorInput, SlotProjector, SlotView};
use common::protocol::{ClientEvent, ServerEvent, SideChannelMessage};
use common::types::{AttachmentLabel, ChannelId, ParticipantId};

/// What caused a view update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateTrigger {
    Control(ServerEvent),
    Media(MediaEvent),
}

/// One processed event and the view after it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantUpdate {
    pub trigger: UpdateTrigger,
    pub view: SlotView,
}

/// A joined channel member.
pub struct ChannelParticipant<M: MediaSession> {
    client: ControlClient,
    media: M,
    projector: SlotProjector,
    channel_id: ChannelId,
    queue: Vec<ParticipantId>,
    collab_occupant: Option<ParticipantId>,
    awaiting_grant: bool,
    awaiting_collab: bool,
}

impl<M: MediaSession> ChannelParticipant<M> {
    /// Join `channel_id` on an open control connection as the media
    /// session's identity.
    ///
    /// # Errors
    ///
    /// Returns whatever [`ControlClient::join`] returns.
    pub async fn join(
        mut client: ControlClient,
        media: M,
        channel_id: ChannelId,
    ) -> Result<Self, ClientError> {
        let identity = media.identity().clone();
        let joined = client.join(&channel_id, &identity).await?;

        let mut projector = SlotProjector::new(identity.clone());
        projector.apply(ProjectorInput::Synced {
            holder: joined.holder.clone(),
            collab_allowed: joined.collab_allowed,
        });

        tracing::info!(
            target: "cc.client",
            channel_id = %channel_id,
            identity = %identity,
            holder = ?joined.holder,
            queue_length = joined.queue.len(),
            "Joined channel"
        );

        let JoinedChannel {
            queue,
            collab_occupant,
            ..
        } = joined;

        Ok(Self {
            client,
            media,
            projector,
            channel_id,
            queue,
            collab_occupant,
            awaiting_grant: false,
            awaiting_collab: false,
        })
    }

    #[must_use]
    pub fn identity(&self) -> &ParticipantId {
        self.projector.local()
    }

    #[must_use]
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Current projected view.
    #[must_use]
    pub fn view(&self) -> SlotView {
        self.projector.view()
    }

    /// Primary holder as last reported by the server.
    #[must_use]
    pub fn holder(&self) -> Option<&ParticipantId> {
        self.projector.holder()
    }

    /// Wait order as last reported by the server.
    #[must_use]
    pub fn queue(&self) -> &[ParticipantId] {
        &self.queue
    }

    /// Secondary occupant as last reported by the server.
    #[must_use]
    pub fn collab_occupant(&self) -> Option<&ParticipantId> {
        self.collab_occupant.as_ref()
    }

    #[must_use]
    pub fn media(&self) -> &M {
        &self.media
    }

    /// Ask for the primary slot. The primary attachment is published once
    /// the grant arrives.
    ///
    /// # Errors
    ///
    /// `AlreadyHolder` if I already hold the slot, `Closed` if the control
    /// connection is gone.
    pub fn take_aux(&mut self) -> Result<(), ClientError> {
        if self.view().i_hold_primary {
            return Err(ClientError::AlreadyHolder);
        }
        self.send(ClientEvent::RequestControl {
            channel_id: self.channel_id.clone(),
        })?;
        self.awaiting_grant = true;
        Ok(())
    }

    /// Stop waiting for the primary slot.
    ///
    /// If the grant is already on its way, it is released on arrival.
    ///
    /// # Errors
    ///
    /// `AlreadyHolder` once I hold the slot (use
    /// [`pass_aux`](Self::pass_aux)), `Closed` if the control connection is
    /// gone.
    pub fn withdraw(&mut self) -> Result<(), ClientError> {
        if self.view().i_hold_primary {
            return Err(ClientError::AlreadyHolder);
        }
        self.awaiting_grant = false;
        self.send(ClientEvent::WithdrawControl {
            channel_id: self.channel_id.clone(),
        })
    }

    /// Give up the primary slot: withdraw the primary attachment, close the
    /// secondary slot if it is open, then release control.
    ///
    /// # Errors
    ///
    /// `NotHolder` if I do not hold the slot. Media and connection errors
    /// are passed through.
    pub async fn pass_aux(&mut self) -> Result<(), ClientError> {
        if !self.view().i_hold_primary {
            return Err(ClientError::NotHolder);
        }
        self.unpublish_local(AttachmentLabel::Primary).await?;
        if self.view().secondary_allowed {
            self.set_collab_allowed(false).await?;
        }
        self.send(ClientEvent::ReleaseControl {
            channel_id: self.channel_id.clone(),
        })
    }

    /// Open or close the secondary slot. The change is sent to the server
    /// and over the media side channel, and applied locally at once.
    ///
    /// # Errors
    ///
    /// `NotHolder` if I do not hold the primary slot.
    pub async fn set_collab_allowed(&mut self, allowed: bool) -> Result<(), ClientError> {
        if !self.view().i_hold_primary {
            return Err(ClientError::NotHolder);
        }
        self.send(ClientEvent::CollabAllow {
            channel_id: self.channel_id.clone(),
            allowed,
        })?;

        let mut messages = vec![SideChannelMessage::Allow { allowed }];
        if !allowed {
            messages.push(SideChannelMessage::Close);
        }
        let me = self.identity().clone();
        for message in messages {
            self.media.publish_data(message.to_bytes()?).await?;
            self.projector.apply(ProjectorInput::SideChannel {
                from: me.clone(),
                message,
            });
        }
        Ok(())
    }

    /// Take the open secondary slot. The secondary attachment is published
    /// once the server confirms the occupancy.
    ///
    /// # Errors
    ///
    /// `AlreadyHolder`, `CollabClosed` or `CollabOccupied` from the local
    /// pre-checks.
    pub fn join_collab(&mut self) -> Result<(), ClientError> {
        let view = self.view();
        if view.i_hold_primary {
            return Err(ClientError::AlreadyHolder);
        }
        if !view.secondary_allowed {
            return Err(ClientError::CollabClosed);
        }
        if view.secondary_occupied {
            return Err(ClientError::CollabOccupied);
        }
        self.send(ClientEvent::CollabOccupy {
            channel_id: self.channel_id.clone(),
        })?;
        self.awaiting_collab = true;
        Ok(())
    }

    /// Leave the secondary slot.
    ///
    /// # Errors
    ///
    /// `NotOccupant` if I have no secondary attachment.
    pub async fn leave_collab(&mut self) -> Result<(), ClientError> {
        if !self.view().i_occupy_secondary {
            return Err(ClientError::NotOccupant);
        }
        self.unpublish_local(AttachmentLabel::Secondary).await?;
        self.send(ClientEvent::CollabVacate {
            channel_id: self.channel_id.clone(),
        })
    }

    /// Relay a negotiation offer to the current holder.
    ///
    /// # Errors
    ///
    /// `NoHolder` if nobody holds the primary slot, `AlreadyHolder` if I do.
    pub fn listen(&mut self, offer: serde_json::Value) -> Result<(), ClientError> {
        let holder = self.holder().cloned().ok_or(ClientError::NoHolder)?;
        if &holder == self.identity() {
            return Err(ClientError::AlreadyHolder);
        }
        self.signal(holder, offer)
    }

    /// Relay an arbitrary negotiation payload to another member.
    ///
    /// # Errors
    ///
    /// `Closed` if the control connection is gone.
    pub fn signal(
        &mut self,
        to_identity: ParticipantId,
        payload: serde_json::Value,
    ) -> Result<(), ClientError> {
        self.send(ClientEvent::Signal {
            channel_id: self.channel_id.clone(),
            to_identity,
            payload,
        })
    }

    /// Ask the server for a fresh snapshot. The reply resyncs the projector
    /// when it arrives through [`next_update`](Self::next_update).
    ///
    /// # Errors
    ///
    /// `Closed` if the control connection is gone.
    pub fn request_snapshot(&mut self) -> Result<(), ClientError> {
        self.send(ClientEvent::Snapshot {
            channel_id: self.channel_id.clone(),
        })
    }

    /// Wait for the next control or media event, apply it and return the
    /// resulting view.
    ///
    /// # Errors
    ///
    /// `Closed` once the control connection is gone. Media errors from a
    /// follow-up publish or teardown are passed through.
    pub async fn next_update(&mut self) -> Result<ParticipantUpdate, ClientError> {
        let trigger = tokio::select! {
            event = self.client.next_event() => {
                UpdateTrigger::Control(event.ok_or(ClientError::Closed)?)
            }
            Some(event) = self.media.next_event() => UpdateTrigger::Media(event),
        };

        match &trigger {
            UpdateTrigger::Control(event) => self.on_control(event).await?,
            UpdateTrigger::Media(event) => {
                if let Some(input) = ProjectorInput::from_media(event) {
                    self.apply(input).await?;
                }
            }
        }

        Ok(ParticipantUpdate {
            trigger,
            view: self.view(),
        })
    }

    /// Close the control connection. The media session is dropped with the
    /// participant.
    pub async fn leave(self) {
        tracing::info!(
            target: "cc.client",
            channel_id = %self.channel_id,
            identity = %self.projector.local(),
            "Leaving channel"
        );
        self.client.close().await;
    }

    async fn on_control(&mut self, event: &ServerEvent) -> Result<(), ClientError> {
        match event {
            ServerEvent::Joined {
                queue,
                collab_occupant,
                ..
            } => {
                self.queue.clone_from(queue);
                self.collab_occupant.clone_from(collab_occupant);
            }
            ServerEvent::Snapshot(snapshot) => {
                self.queue.clone_from(&snapshot.queue);
                self.collab_occupant.clone_from(&snapshot.collab_occupant);
            }
            ServerEvent::QueueUpdated { queue } => self.queue.clone_from(queue),
            ServerEvent::CollabOccupied { identity } => {
                self.collab_occupant.clone_from(identity);
                if self.awaiting_collab && identity.as_ref() == Some(self.identity()) {
                    self.awaiting_collab = false;
                    self.publish_local(AttachmentLabel::Secondary).await?;
                }
            }
            ServerEvent::Rejected {
                action,
                code,
                reason,
            } => {
                tracing::debug!(
                    target: "cc.client",
                    action = %action,
                    code = *code,
                    reason = %reason,
                    "Action rejected by server"
                );
                match action.as_str() {
                    "requestControl" => self.awaiting_grant = false,
                    "collabOccupy" => self.awaiting_collab = false,
                    _ => {}
                }
            }
            _ => {}
        }

        if let Some(input) = ProjectorInput::from_server(event) {
            self.apply(input).await?;
        }

        match event {
            ServerEvent::Granted { identity } if identity == self.identity() => {
                if self.awaiting_grant {
                    self.awaiting_grant = false;
                    self.publish_local(AttachmentLabel::Primary).await?;
                } else {
                    tracing::info!(
                        target: "cc.client",
                        channel_id = %self.channel_id,
                        identity = %self.identity(),
                        "Granted after withdrawing, releasing"
                    );
                    self.send(ClientEvent::ReleaseControl {
                        channel_id: self.channel_id.clone(),
                    })?;
                }
            }
            ServerEvent::Snapshot(snapshot)
                if self.awaiting_grant && snapshot.holder.as_ref() == Some(self.identity()) =>
            {
                self.awaiting_grant = false;
                self.publish_local(AttachmentLabel::Primary).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn apply(&mut self, input: ProjectorInput) -> Result<(), ClientError> {
        let projection = self.projector.apply(input);
        if let Some(ProjectorEffect::TearDownSecondary) = projection.effect {
            self.awaiting_collab = false;
            self.unpublish_local(AttachmentLabel::Secondary).await?;
        }
        Ok(())
    }

    async fn publish_local(&mut self, label: AttachmentLabel) -> Result<(), ClientError> {
        self.media.publish(label).await?;
        tracing::debug!(target: "cc.client", identity = %self.identity(), label = %label, "Published attachment");
        self.projector.apply(ProjectorInput::AttachmentAdded {
            participant: self.identity().clone(),
            label,
        });
        Ok(())
    }

    async fn unpublish_local(&mut self, label: AttachmentLabel) -> Result<(), ClientError> {
        self.media.unpublish(label).await?;
        tracing::debug!(target: "cc.client", identity = %self.identity(), label = %label, "Withdrew attachment");
        self.projector.apply(ProjectorInput::AttachmentRemoved {
            participant: self.identity().clone(),
            label,
        });
        Ok(())
    }

    fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        tracing::trace!(target: "cc.client", event = event.name(), "Sending event");
        self.client.send(event)
    }
}
