//! Slot Projector.
//!
//! Derives what one participant should show about the two slots from two
//! independent sources: attachment notifications from the media transport
//! and permission messages from the control plane (or the side channel).
//!
//! Every input lands in a last-writer-wins register and the view is
//! recomputed from the registers by [`SlotProjector::view`], so applying the
//! same sequence twice yields the same view as applying it once. The
//! projector never talks to the server.
//!
//! Side-channel permission messages only count when their sender is the
//! holder on record. Anything else (a non-holder, or a previous holder whose
//! message arrives after the hand-over) is ignored.

use crate::media::MediaEvent;
use common::protocol::{ServerEvent, SideChannelMessage};
use common::types::{AttachmentLabel, ParticipantId};
use std::collections::{HashMap, HashSet};

/// The four booleans a participant renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotView {
    /// I hold the primary slot.
    pub i_hold_primary: bool,
    /// The holder has opened the secondary slot.
    pub secondary_allowed: bool,
    /// Someone (possibly me) has a secondary attachment.
    pub secondary_occupied: bool,
    /// I have a secondary attachment.
    pub i_occupy_secondary: bool,
}

/// A single projector trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectorInput {
    ParticipantJoined(ParticipantId),
    /// Drops every attachment of that participant.
    ParticipantLeft(ParticipantId),
    AttachmentAdded {
        participant: ParticipantId,
        label: AttachmentLabel,
    },
    AttachmentRemoved {
        participant: ParticipantId,
        label: AttachmentLabel,
    },
    Granted(ParticipantId),
    Cleared,
    CollabAllow(bool),
    /// Forces the slot closed and asks the occupant to tear down.
    CollabClose,
    /// Permission message from the media data channel.
    SideChannel {
        from: ParticipantId,
        message: SideChannelMessage,
    },
    /// Full permission state from a `joined` or `snapshot` reply.
    Synced {
        holder: Option<ParticipantId>,
        collab_allowed: bool,
    },
}

impl ProjectorInput {
    /// Map a control-plane event to a projector input, if it carries one.
    #[must_use]
    pub fn from_server(event: &ServerEvent) -> Option<Self> {
        match event {
            ServerEvent::Joined {
                holder,
                collab_allowed,
                ..
            } => Some(ProjectorInput::Synced {
                holder: holder.clone(),
                collab_allowed: *collab_allowed,
            }),
            ServerEvent::Snapshot(snapshot) => Some(ProjectorInput::Synced {
                holder: snapshot.holder.clone(),
                collab_allowed: snapshot.collab_allowed,
            }),
            ServerEvent::Granted { identity } => Some(ProjectorInput::Granted(identity.clone())),
            ServerEvent::Cleared => Some(ProjectorInput::Cleared),
            ServerEvent::CollabAllow { allowed } => Some(ProjectorInput::CollabAllow(*allowed)),
            ServerEvent::CollabClose => Some(ProjectorInput::CollabClose),
            _ => None,
        }
    }

    /// Map a media notification to a projector input.
    ///
    /// Data payloads are decoded as side-channel messages; anything else on
    /// the data channel is ignored.
    #[must_use]
    pub fn from_media(event: &MediaEvent) -> Option<Self> {
        match event {
            MediaEvent::ParticipantJoined(p) => Some(ProjectorInput::ParticipantJoined(p.clone())),
            MediaEvent::ParticipantLeft(p) => Some(ProjectorInput::ParticipantLeft(p.clone())),
            MediaEvent::AttachmentAdded { participant, label } => {
                Some(ProjectorInput::AttachmentAdded {
                    participant: participant.clone(),
                    label: *label,
                })
            }
            MediaEvent::AttachmentRemoved { participant, label } => {
                Some(ProjectorInput::AttachmentRemoved {
                    participant: participant.clone(),
                    label: *label,
                })
            }
            MediaEvent::Data { from, payload } => match SideChannelMessage::from_bytes(payload) {
                Ok(message) => Some(ProjectorInput::SideChannel {
                    from: from.clone(),
                    message,
                }),
                Err(e) => {
                    tracing::debug!(
                        target: "cc.client.projector",
                        from = %from,
                        error = %e,
                        "Ignoring data payload that is not a slot message"
                    );
                    None
                }
            },
        }
    }
}

/// Local action the projector asks its owner to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorEffect {
    /// Withdraw my own secondary attachment.
    TearDownSecondary,
}

/// Result of applying one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    pub view: SlotView,
    pub effect: Option<ProjectorEffect>,
}

/// Per-participant slot state derived from attachments and permissions.
#[derive(Debug, Clone)]
pub struct SlotProjector {
    local: ParticipantId,
    attachments: HashMap<ParticipantId, HashSet<AttachmentLabel>>,
    /// `None` until the first `granted`/`cleared`/sync has been seen.
    holder: Option<Option<ParticipantId>>,
    collab_allowed: bool,
}

impl SlotProjector {
    #[must_use]
    pub fn new(local: ParticipantId) -> Self {
        Self {
            local,
            attachments: HashMap::new(),
            holder: None,
            collab_allowed: false,
        }
    }

    /// Identity the view is computed for.
    #[must_use]
    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Apply one input and recompute.
    pub fn apply(&mut self, input: ProjectorInput) -> Projection {
        let mut effect = None;
        match input {
            ProjectorInput::ParticipantJoined(_) => {}
            ProjectorInput::ParticipantLeft(participant) => {
                self.attachments.remove(&participant);
            }
            ProjectorInput::AttachmentAdded { participant, label } => {
                self.attachments.entry(participant).or_default().insert(label);
            }
            ProjectorInput::AttachmentRemoved { participant, label } => {
                if let Some(labels) = self.attachments.get_mut(&participant) {
                    labels.remove(&label);
                    if labels.is_empty() {
                        self.attachments.remove(&participant);
                    }
                }
            }
            ProjectorInput::Granted(identity) => self.holder = Some(Some(identity)),
            ProjectorInput::Cleared => self.holder = Some(None),
            ProjectorInput::CollabAllow(allowed) => self.collab_allowed = allowed,
            ProjectorInput::CollabClose => effect = self.close_collab(),
            ProjectorInput::SideChannel { from, message } => {
                if self.holder() == Some(&from) {
                    match message {
                        SideChannelMessage::Allow { allowed } => self.collab_allowed = allowed,
                        SideChannelMessage::Close => effect = self.close_collab(),
                    }
                } else {
                    tracing::debug!(
                        target: "cc.client.projector",
                        from = %from,
                        holder = ?self.holder().map(ParticipantId::as_str),
                        "Ignoring slot message from a participant not holding primary"
                    );
                }
            }
            ProjectorInput::Synced {
                holder,
                collab_allowed,
            } => {
                self.holder = Some(holder);
                if collab_allowed {
                    self.collab_allowed = true;
                } else {
                    // A resync that finds the slot closed closes it here too
                    effect = self.close_collab();
                }
            }
        }
        Projection {
            view: self.view(),
            effect,
        }
    }

    /// Recompute the view from the current registers.
    #[must_use]
    pub fn view(&self) -> SlotView {
        let i_hold_primary = match &self.holder {
            Some(holder) => holder.as_ref() == Some(&self.local),
            None => self.has(&self.local, AttachmentLabel::Primary),
        };
        SlotView {
            i_hold_primary,
            secondary_allowed: self.collab_allowed,
            secondary_occupied: self
                .attachments
                .values()
                .any(|labels| labels.contains(&AttachmentLabel::Secondary)),
            i_occupy_secondary: self.has(&self.local, AttachmentLabel::Secondary),
        }
    }

    /// Current primary holder as last reported by the control plane.
    #[must_use]
    pub fn holder(&self) -> Option<&ParticipantId> {
        self.holder.as_ref().and_then(Option::as_ref)
    }

    fn close_collab(&mut self) -> Option<ProjectorEffect> {
        self.collab_allowed = false;
        if !self.has(&self.local, AttachmentLabel::Secondary) {
            return None;
        }
        tracing::debug!(
            target: "cc.client.projector",
            identity = %self.local,
            "Collab closed while occupying, requesting teardown"
        );
        Some(ProjectorEffect::TearDownSecondary)
    }

    fn has(&self, participant: &ParticipantId, label: AttachmentLabel) -> bool {
        self.attachments
            .get(participant)
            .is_some_and(|labels| labels.contains(&label))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn id(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn added(p: &str, label: AttachmentLabel) -> ProjectorInput {
        ProjectorInput::AttachmentAdded {
            participant: id(p),
            label,
        }
    }

    #[test]
    fn test_fresh_projector_shows_nothing() {
        let projector = SlotProjector::new(id("a"));
        assert_eq!(projector.view(), SlotView::default());
        assert_eq!(projector.holder(), None);
    }

    #[test]
    fn test_primary_falls_back_to_attachment_before_any_permission() {
        let mut projector = SlotProjector::new(id("a"));
        let p = projector.apply(added("a", AttachmentLabel::Primary));
        assert!(p.view.i_hold_primary);

        // Once the control plane has spoken it wins over the attachment
        let p = projector.apply(ProjectorInput::Granted(id("b")));
        assert!(!p.view.i_hold_primary);
        let p = projector.apply(ProjectorInput::Cleared);
        assert!(!p.view.i_hold_primary);
    }

    #[test]
    fn test_granted_names_me() {
        let mut projector = SlotProjector::new(id("a"));
        let p = projector.apply(ProjectorInput::Granted(id("a")));
        assert!(p.view.i_hold_primary);
        assert_eq!(projector.holder(), Some(&id("a")));
    }

    #[test]
    fn test_remote_secondary_marks_occupied_only() {
        let mut projector = SlotProjector::new(id("a"));
        projector.apply(ProjectorInput::CollabAllow(true));
        let p = projector.apply(added("b", AttachmentLabel::Secondary));
        assert!(p.view.secondary_allowed);
        assert!(p.view.secondary_occupied);
        assert!(!p.view.i_occupy_secondary);
    }

    #[test]
    fn test_participant_left_drops_their_attachments() {
        let mut projector = SlotProjector::new(id("a"));
        projector.apply(added("b", AttachmentLabel::Secondary));
        projector.apply(added("b", AttachmentLabel::Primary));
        let p = projector.apply(ProjectorInput::ParticipantLeft(id("b")));
        assert!(!p.view.secondary_occupied);
    }

    #[test]
    fn test_collab_close_tears_down_own_secondary() {
        let mut projector = SlotProjector::new(id("a"));
        projector.apply(ProjectorInput::CollabAllow(true));
        projector.apply(added("a", AttachmentLabel::Secondary));

        let p = projector.apply(ProjectorInput::CollabClose);
        assert_eq!(p.effect, Some(ProjectorEffect::TearDownSecondary));
        assert!(!p.view.secondary_allowed);

        let p = projector.apply(ProjectorInput::AttachmentRemoved {
            participant: id("a"),
            label: AttachmentLabel::Secondary,
        });
        assert!(!p.view.i_occupy_secondary);
        assert!(!p.view.secondary_occupied);
        assert_eq!(p.effect, None);
    }

    #[test]
    fn test_collab_close_without_occupying_has_no_effect() {
        let mut projector = SlotProjector::new(id("a"));
        projector.apply(added("b", AttachmentLabel::Secondary));
        let p = projector.apply(ProjectorInput::CollabClose);
        assert_eq!(p.effect, None);
    }

    #[test]
    fn test_replaying_sequence_is_idempotent() {
        let sequence = vec![
            ProjectorInput::Synced {
                holder: None,
                collab_allowed: false,
            },
            ProjectorInput::Granted(id("c")),
            ProjectorInput::CollabAllow(true),
            ProjectorInput::CollabAllow(true),
            added("c", AttachmentLabel::Primary),
            added("a", AttachmentLabel::Secondary),
            ProjectorInput::ParticipantJoined(id("d")),
            ProjectorInput::CollabAllow(false),
            ProjectorInput::CollabClose,
        ];

        let mut once = SlotProjector::new(id("a"));
        for input in sequence.clone() {
            once.apply(input);
        }

        let mut twice = SlotProjector::new(id("a"));
        for input in sequence.iter().chain(sequence.iter()).cloned() {
            twice.apply(input);
        }

        assert_eq!(once.view(), twice.view());
        assert_eq!(
            once.view(),
            SlotView {
                i_hold_primary: false,
                secondary_allowed: false,
                secondary_occupied: true,
                i_occupy_secondary: true,
            }
        );
    }

    #[test]
    fn test_server_event_mapping() {
        assert_eq!(
            ProjectorInput::from_server(&ServerEvent::Granted { identity: id("b") }),
            Some(ProjectorInput::Granted(id("b")))
        );
        assert_eq!(
            ProjectorInput::from_server(&ServerEvent::CollabClose),
            Some(ProjectorInput::CollabClose)
        );
        assert_eq!(ProjectorInput::from_server(&ServerEvent::Pong), None);
        assert_eq!(
            ProjectorInput::from_server(&ServerEvent::QueueUpdated { queue: vec![] }),
            None
        );
    }

    #[test]
    fn test_side_channel_data_mapping() {
        let allow = MediaEvent::Data {
            from: id("c"),
            payload: br#"{"type":"collab:allow","allowed":true}"#.to_vec(),
        };
        assert_eq!(
            ProjectorInput::from_media(&allow),
            Some(ProjectorInput::SideChannel {
                from: id("c"),
                message: SideChannelMessage::Allow { allowed: true },
            })
        );

        let chatter = MediaEvent::Data {
            from: id("c"),
            payload: br#"{"type":"chat","text":"hi"}"#.to_vec(),
        };
        assert_eq!(ProjectorInput::from_media(&chatter), None);
    }

    fn side_channel(from: &str, message: SideChannelMessage) -> ProjectorInput {
        ProjectorInput::SideChannel {
            from: id(from),
            message,
        }
    }

    #[test]
    fn test_side_channel_from_holder_is_applied() {
        let mut projector = SlotProjector::new(id("a"));
        projector.apply(ProjectorInput::Granted(id("c")));

        let p = projector.apply(side_channel("c", SideChannelMessage::Allow { allowed: true }));
        assert!(p.view.secondary_allowed);

        projector.apply(added("a", AttachmentLabel::Secondary));
        let p = projector.apply(side_channel("c", SideChannelMessage::Close));
        assert!(!p.view.secondary_allowed);
        assert_eq!(p.effect, Some(ProjectorEffect::TearDownSecondary));
    }

    #[test]
    fn test_side_channel_from_non_holder_is_ignored() {
        let mut projector = SlotProjector::new(id("a"));
        projector.apply(ProjectorInput::Granted(id("c")));

        let p = projector.apply(side_channel("b", SideChannelMessage::Allow { allowed: true }));
        assert!(!p.view.secondary_allowed);

        // Nor can a non-holder close a slot the holder opened
        projector.apply(ProjectorInput::CollabAllow(true));
        projector.apply(added("a", AttachmentLabel::Secondary));
        let p = projector.apply(side_channel("b", SideChannelMessage::Close));
        assert!(p.view.secondary_allowed);
        assert_eq!(p.effect, None);
    }

    #[test]
    fn test_late_allow_from_previous_holder_does_not_reopen() {
        let mut projector = SlotProjector::new(id("c"));
        projector.apply(ProjectorInput::Granted(id("a")));
        projector.apply(ProjectorInput::CollabAllow(true));

        // Hand-over cascade from the server, then a's allow arrives late
        projector.apply(ProjectorInput::CollabAllow(false));
        projector.apply(ProjectorInput::CollabClose);
        projector.apply(ProjectorInput::Granted(id("b")));
        let p = projector.apply(side_channel("a", SideChannelMessage::Allow { allowed: true }));

        assert!(!p.view.secondary_allowed);
        assert_eq!(projector.holder(), Some(&id("b")));
    }

    #[test]
    fn test_side_channel_ignored_before_any_holder_is_known() {
        let mut projector = SlotProjector::new(id("a"));
        let p = projector.apply(side_channel("c", SideChannelMessage::Allow { allowed: true }));
        assert!(!p.view.secondary_allowed);
    }

    #[test]
    fn test_closed_resync_tears_down_own_secondary() {
        let mut projector = SlotProjector::new(id("a"));
        projector.apply(ProjectorInput::Granted(id("c")));
        projector.apply(ProjectorInput::CollabAllow(true));
        projector.apply(added("a", AttachmentLabel::Secondary));

        // The close itself was missed; the snapshot says the slot is shut
        let p = projector.apply(ProjectorInput::Synced {
            holder: Some(id("b")),
            collab_allowed: false,
        });
        assert!(!p.view.secondary_allowed);
        assert_eq!(p.effect, Some(ProjectorEffect::TearDownSecondary));
    }
}
