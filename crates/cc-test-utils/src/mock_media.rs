//! In-memory media room
//!
//! `MockMediaRoom` stands in for the media transport. Each connected
//! `MockMediaSession` sees remote participants join and leave, remote
//! attachments come and go, and remote data-channel payloads, in the order
//! they happened.
//!
//! The room enforces that at most one attachment of each label exists at a
//! time, so a test fails loudly if two participants ever publish `aux` at
//! once.

use channel_client::{ClientError, MediaEvent, MediaSession};
use common::types::{AttachmentLabel, ParticipantId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct RoomState {
    members: HashMap<ParticipantId, mpsc::UnboundedSender<MediaEvent>>,
    attachments: HashMap<AttachmentLabel, ParticipantId>,
    data_log: Vec<(ParticipantId, Vec<u8>)>,
}

impl RoomState {
    fn broadcast_except(&self, sender: &ParticipantId, event: &MediaEvent) {
        for (identity, tx) in &self.members {
            if identity != sender {
                let _ = tx.send(event.clone());
            }
        }
    }
}

/// Shared in-memory media room.
#[derive(Clone, Default)]
pub struct MockMediaRoom {
    state: Arc<Mutex<RoomState>>,
}

impl MockMediaRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a participant. Existing participants and attachments are
    /// replayed to the newcomer as join/added events.
    pub fn connect(&self, identity: impl Into<String>) -> MockMediaSession {
        let identity = ParticipantId::new(identity);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.lock();
        for existing in state.members.keys() {
            let _ = tx.send(MediaEvent::ParticipantJoined(existing.clone()));
        }
        for (label, owner) in &state.attachments {
            let _ = tx.send(MediaEvent::AttachmentAdded {
                participant: owner.clone(),
                label: *label,
            });
        }
        state.broadcast_except(&identity, &MediaEvent::ParticipantJoined(identity.clone()));
        state.members.insert(identity.clone(), tx);
        drop(state);

        MockMediaSession {
            identity,
            room: self.clone(),
            events: tokio::sync::Mutex::new(rx),
        }
    }

    /// Current owner of an attachment label.
    pub fn owner_of(&self, label: AttachmentLabel) -> Option<ParticipantId> {
        self.lock().attachments.get(&label).cloned()
    }

    /// Identities currently connected.
    pub fn members(&self) -> HashSet<ParticipantId> {
        self.lock().members.keys().cloned().collect()
    }

    /// Every data-channel payload sent so far, with its sender.
    pub fn data_log(&self) -> Vec<(ParticipantId, Vec<u8>)> {
        self.lock().data_log.clone()
    }

    fn disconnect(&self, identity: &ParticipantId) {
        let mut state = self.lock();
        if state.members.remove(identity).is_none() {
            return;
        }
        state.attachments.retain(|_, owner| owner != identity);
        state.broadcast_except(identity, &MediaEvent::ParticipantLeft(identity.clone()));
    }

    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One participant's connection to a [`MockMediaRoom`].
///
/// Dropping the session disconnects it and withdraws its attachments.
pub struct MockMediaSession {
    identity: ParticipantId,
    room: MockMediaRoom,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<MediaEvent>>,
}

#[async_trait::async_trait]
impl MediaSession for MockMediaSession {
    fn identity(&self) -> &ParticipantId {
        &self.identity
    }

    async fn publish(&self, label: AttachmentLabel) -> Result<(), ClientError> {
        let mut state = self.room.lock();
        if let Some(owner) = state.attachments.get(&label) {
            if owner == &self.identity {
                return Ok(());
            }
            return Err(ClientError::Media(format!(
                "{label} is already published by {owner}"
            )));
        }
        state.attachments.insert(label, self.identity.clone());
        state.broadcast_except(
            &self.identity,
            &MediaEvent::AttachmentAdded {
                participant: self.identity.clone(),
                label,
            },
        );
        tracing::debug!(identity = %self.identity, label = %label, "mock media: published");
        Ok(())
    }

    async fn unpublish(&self, label: AttachmentLabel) -> Result<(), ClientError> {
        let mut state = self.room.lock();
        if state.attachments.get(&label) != Some(&self.identity) {
            return Ok(());
        }
        state.attachments.remove(&label);
        state.broadcast_except(
            &self.identity,
            &MediaEvent::AttachmentRemoved {
                participant: self.identity.clone(),
                label,
            },
        );
        tracing::debug!(identity = %self.identity, label = %label, "mock media: unpublished");
        Ok(())
    }

    async fn publish_data(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        let mut state = self.room.lock();
        state.broadcast_except(
            &self.identity,
            &MediaEvent::Data {
                from: self.identity.clone(),
                payload: payload.clone(),
            },
        );
        state.data_log.push((self.identity.clone(), payload));
        Ok(())
    }

    async fn next_event(&self) -> Option<MediaEvent> {
        self.events.lock().await.recv().await
    }
}

impl Drop for MockMediaSession {
    fn drop(&mut self) {
        self.room.disconnect(&self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    #[tokio::test]
    async fn test_publish_is_seen_by_others_only() {
        let room = MockMediaRoom::new();
        let a = room.connect("a");
        let b = room.connect("b");

        assert_eq!(
            a.next_event().await,
            Some(MediaEvent::ParticipantJoined(id("b")))
        );

        b.publish(AttachmentLabel::Primary).await.unwrap();
        assert_eq!(
            a.next_event().await,
            Some(MediaEvent::AttachmentAdded {
                participant: id("b"),
                label: AttachmentLabel::Primary,
            })
        );
        assert_eq!(room.owner_of(AttachmentLabel::Primary), Some(id("b")));
    }

    #[tokio::test]
    async fn test_label_is_exclusive() {
        let room = MockMediaRoom::new();
        let a = room.connect("a");
        let b = room.connect("b");

        a.publish(AttachmentLabel::Primary).await.unwrap();
        let err = b.publish(AttachmentLabel::Primary).await.unwrap_err();
        assert!(matches!(err, ClientError::Media(_)));

        // Republishing your own label is fine
        a.publish(AttachmentLabel::Primary).await.unwrap();
    }

    #[tokio::test]
    async fn test_newcomer_sees_existing_state() {
        let room = MockMediaRoom::new();
        let a = room.connect("a");
        a.publish(AttachmentLabel::Secondary).await.unwrap();

        let b = room.connect("b");
        assert_eq!(
            b.next_event().await,
            Some(MediaEvent::ParticipantJoined(id("a")))
        );
        assert_eq!(
            b.next_event().await,
            Some(MediaEvent::AttachmentAdded {
                participant: id("a"),
                label: AttachmentLabel::Secondary,
            })
        );
    }

    #[tokio::test]
    async fn test_drop_disconnects_and_withdraws() {
        let room = MockMediaRoom::new();
        let a = room.connect("a");
        let b = room.connect("b");
        let _ = a.next_event().await; // b joined

        b.publish(AttachmentLabel::Primary).await.unwrap();
        let _ = a.next_event().await; // b added aux
        drop(b);

        assert_eq!(
            a.next_event().await,
            Some(MediaEvent::ParticipantLeft(id("b")))
        );
        assert_eq!(room.owner_of(AttachmentLabel::Primary), None);
        assert_eq!(room.members(), HashSet::from([id("a")]));
    }

    #[tokio::test]
    async fn test_data_is_logged_and_relayed() {
        let room = MockMediaRoom::new();
        let a = room.connect("a");
        let b = room.connect("b");
        let _ = a.next_event().await;

        b.publish_data(b"hello".to_vec()).await.unwrap();
        assert_eq!(
            a.next_event().await,
            Some(MediaEvent::Data {
                from: id("b"),
                payload: b"hello".to_vec(),
            })
        );
        assert_eq!(room.data_log(), vec![(id("b"), b"hello".to_vec())]);
    }
}
