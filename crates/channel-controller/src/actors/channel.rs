//! `ChannelActor` - per-channel actor that owns arbitration state.
//!
//! Each `ChannelActor`:
//! - Owns the `ChannelState` for one channel
//! - Applies joins, leaves and commands strictly one at a time
//! - Fans committed events out to every member's `ConnectionActor`
//! - Publishes a fresh `ChannelSnapshot` through a `watch` after each commit
//!
//! # Delivery
//!
//! Replies to the requester are queued before the broadcast of the same
//! commit. Broadcasts use `try_deliver`; a member whose outbound queue is
//! full misses the event (logged and counted) and the commit stands.
//!
//! A member that missed an event is marked stale. After every later commit
//! and on a short timer, the actor offers each stale member a `snapshot` of
//! the current state; the mark clears once one fits in its queue.
//!
//! # Lifecycle
//!
//! The registry sends `TryClose` after each leave. An empty channel answers
//! `true` and stops; joins still in its mailbox fail with `ChannelClosed` so
//! the caller can retry against a fresh channel.

use crate::arbiter::{ChannelState, Transition};
use crate::errors::CcError;
use crate::observability::metrics as prom;

use super::connection::ConnectionActorHandle;
use super::messages::{ChannelCommand, ChannelMessage};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::protocol::{ChannelSnapshot, ServerEvent};
use common::types::{ChannelId, ParticipantId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the channel mailbox.
const CHANNEL_MAILBOX_BUFFER: usize = 500;

/// How often stale members are offered a resync snapshot.
const RESYNC_INTERVAL: Duration = Duration::from_millis(250);

/// Handle to a `ChannelActor`.
#[derive(Clone, Debug)]
pub struct ChannelActorHandle {
    sender: mpsc::Sender<ChannelMessage>,
    cancel_token: CancellationToken,
    channel_id: ChannelId,
    snapshot: watch::Receiver<ChannelSnapshot>,
}

impl ChannelActorHandle {
    #[must_use]
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Join the channel with `connection` as the member's outbound path.
    ///
    /// On success the `joined` reply is already queued on `connection`.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` if the actor has stopped, or the arbiter's rejection.
    pub async fn join(
        &self,
        participant: ParticipantId,
        connection: ConnectionActorHandle,
    ) -> Result<(), CcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::Join {
                participant,
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| CcError::ChannelClosed)?;

        rx.await.map_err(|_| CcError::ChannelClosed)?
    }

    /// Remove a member. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `CcError::Internal` if the actor has stopped.
    pub async fn leave(&self, participant: ParticipantId) -> Result<(), CcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::Leave {
                participant,
                respond_to: tx,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))
    }

    /// Apply an arbitration command. Resolves once the commit is broadcast.
    ///
    /// # Errors
    ///
    /// `CcError::Arbiter` when refused, `CcError::Internal` if the actor has stopped.
    pub async fn command(
        &self,
        participant: ParticipantId,
        command: ChannelCommand,
    ) -> Result<(), CcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::Command {
                participant,
                command,
                respond_to: tx,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Forward a negotiation payload. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns `CcError::Internal` if the actor has stopped.
    pub async fn relay(
        &self,
        from: ParticipantId,
        to: ParticipantId,
        payload: serde_json::Value,
    ) -> Result<(), CcError> {
        self.sender
            .send(ChannelMessage::Relay { from, to, payload })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))
    }

    /// Ask the channel to stop if it has no members.
    ///
    /// Returns `true` if the channel closed (or had already stopped).
    ///
    /// # Errors
    ///
    /// Never fails today; kept fallible to match the other handle methods.
    pub async fn try_close(&self) -> Result<bool, CcError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ChannelMessage::TryClose { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(true);
        }

        Ok(rx.await.unwrap_or(true))
    }

    /// Latest committed view. Does not wait behind queued mutations.
    #[must_use]
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Cancel the channel actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ChannelActor` implementation.
pub struct ChannelActor {
    channel_id: ChannelId,
    state: ChannelState,
    connections: HashMap<ParticipantId, ConnectionActorHandle>,
    /// Members that missed at least one event since their last snapshot.
    stale: HashSet<ParticipantId>,
    receiver: mpsc::Receiver<ChannelMessage>,
    cancel_token: CancellationToken,
    snapshot_tx: watch::Sender<ChannelSnapshot>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ChannelActor {
    /// Spawn a channel actor.
    pub fn spawn(
        channel_id: ChannelId,
        max_members: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ChannelActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_MAILBOX_BUFFER);
        let state = ChannelState::new(channel_id.clone(), max_members);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());

        let actor = Self {
            channel_id: channel_id.clone(),
            state,
            connections: HashMap::new(),
            stale: HashSet::new(),
            receiver,
            cancel_token: cancel_token.clone(),
            snapshot_tx,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Channel, channel_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ChannelActorHandle {
            sender,
            cancel_token,
            channel_id,
            snapshot: snapshot_rx,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "cc.actor.channel", fields(channel_id = %self.channel_id))]
    async fn run(mut self) {
        info!(
            target: "cc.actor.channel",
            channel_id = %self.channel_id,
            "ChannelActor started"
        );

        let mut resync = tokio::time::interval(RESYNC_INTERVAL);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "cc.actor.channel",
                        channel_id = %self.channel_id,
                        "ChannelActor received cancellation signal"
                    );
                    break;
                }

                _ = resync.tick(), if !self.stale.is_empty() => {
                    self.resync_stale();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_receive(self.receiver.len());
                            let should_exit = self.handle_message(message);
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "cc.actor.channel",
                                channel_id = %self.channel_id,
                                "ChannelActor mailbox closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cc.actor.channel",
            channel_id = %self.channel_id,
            members_remaining = self.state.members().len(),
            messages_processed = self.mailbox.messages_processed(),
            "ChannelActor stopped"
        );
    }

    /// Handle one message. Returns true if the actor should exit.
    fn handle_message(&mut self, message: ChannelMessage) -> bool {
        match message {
            ChannelMessage::Join {
                participant,
                connection,
                respond_to,
            } => {
                let result = self.handle_join(participant, connection);
                let _ = respond_to.send(result);
                false
            }

            ChannelMessage::Leave {
                participant,
                respond_to,
            } => {
                self.handle_leave(&participant);
                let _ = respond_to.send(());
                false
            }

            ChannelMessage::Command {
                participant,
                command,
                respond_to,
            } => {
                let result = self.handle_command(&participant, command);
                let _ = respond_to.send(result);
                false
            }

            ChannelMessage::Relay { from, to, payload } => {
                self.handle_relay(from, &to, payload);
                false
            }

            ChannelMessage::TryClose { respond_to } => {
                let closing = self.state.is_empty();
                let _ = respond_to.send(closing);
                if closing {
                    debug!(
                        target: "cc.actor.channel",
                        channel_id = %self.channel_id,
                        "Channel empty, closing"
                    );
                }
                closing
            }
        }
    }

    fn handle_join(
        &mut self,
        participant: ParticipantId,
        connection: ConnectionActorHandle,
    ) -> Result<(), CcError> {
        let transition = self.state.join(&participant)?;

        debug!(
            target: "cc.actor.channel",
            channel_id = %self.channel_id,
            participant = %participant,
            connection_id = %connection.connection_id(),
            members = self.state.members().len(),
            "Member joined"
        );

        self.connections.insert(participant.clone(), connection);
        self.commit(&participant, transition);
        Ok(())
    }

    fn handle_leave(&mut self, participant: &ParticipantId) {
        let transition = self.state.leave(participant);
        self.stale.remove(participant);
        if self.connections.remove(participant).is_none() && transition.is_noop() {
            return;
        }

        debug!(
            target: "cc.actor.channel",
            channel_id = %self.channel_id,
            participant = %participant,
            members = self.state.members().len(),
            "Member left"
        );

        self.commit(participant, transition);
    }

    fn handle_command(
        &mut self,
        participant: &ParticipantId,
        command: ChannelCommand,
    ) -> Result<(), CcError> {
        let transition = command.apply(&mut self.state, participant).map_err(|e| {
            debug!(
                target: "cc.actor.channel",
                channel_id = %self.channel_id,
                participant = %participant,
                action = command.action(),
                reason = e.reason(),
                "Command rejected"
            );
            CcError::from(e)
        })?;

        self.commit(participant, transition);
        Ok(())
    }

    fn handle_relay(&self, from: ParticipantId, to: &ParticipantId, payload: serde_json::Value) {
        if !self.state.is_member(&from) {
            debug!(
                target: "cc.actor.channel",
                channel_id = %self.channel_id,
                "Relay from non-member dropped"
            );
            prom::record_relay_dropped();
            return;
        }

        let Some(target) = self.connections.get(to) else {
            debug!(
                target: "cc.actor.channel",
                channel_id = %self.channel_id,
                from = %from,
                to = %to,
                "Relay target not in channel, dropped"
            );
            prom::record_relay_dropped();
            return;
        };

        let event = ServerEvent::Signal {
            from_identity: from,
            payload,
        };
        if let Err(e) = target.try_deliver(event) {
            warn!(
                target: "cc.actor.channel",
                channel_id = %self.channel_id,
                to = %to,
                error = %e,
                "Relay delivery failed"
            );
            prom::record_relay_dropped();
        }
    }

    /// Deliver a committed transition and publish the new snapshot.
    fn commit(&mut self, requester: &ParticipantId, transition: Transition) {
        if let Some(reason) = transition.granted {
            prom::record_grant(reason.as_str());
            info!(
                target: "cc.actor.channel",
                channel_id = %self.channel_id,
                holder = ?self.state.holder().map(ParticipantId::as_str),
                reason = reason.as_str(),
                "Control granted"
            );
        }

        let mut missed = Vec::new();

        if let Some(reply) = transition.reply {
            if let Some(connection) = self.connections.get(requester) {
                if !self.deliver(requester, connection, reply) {
                    missed.push(requester.clone());
                }
            }
        }

        for event in transition.broadcast {
            // Join order keeps fan-out deterministic
            for member in self.state.members() {
                if let Some(connection) = self.connections.get(member) {
                    if !self.deliver(member, connection, event.clone()) {
                        missed.push(member.clone());
                    }
                }
            }
        }

        self.snapshot_tx.send_replace(self.state.snapshot());

        self.stale.extend(missed);
        self.resync_stale();
    }

    /// Returns false if the member's queue refused the event.
    fn deliver(
        &self,
        member: &ParticipantId,
        connection: &ConnectionActorHandle,
        event: ServerEvent,
    ) -> bool {
        let name = event.name();
        match connection.try_deliver(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    target: "cc.actor.channel",
                    channel_id = %self.channel_id,
                    member = %member,
                    event = name,
                    error = %e,
                    "Dropped event for member"
                );
                prom::record_broadcast_dropped();
                false
            }
        }
    }

    /// Offer every stale member the current snapshot.
    fn resync_stale(&mut self) {
        if self.stale.is_empty() {
            return;
        }

        let snapshot = self.state.snapshot();
        let connections = &self.connections;
        let channel_id = &self.channel_id;
        self.stale.retain(|member| {
            let Some(connection) = connections.get(member) else {
                return false;
            };
            if !connection.has_room() {
                return true;
            }
            match connection.try_deliver(ServerEvent::Snapshot(snapshot.clone())) {
                Ok(()) => {
                    debug!(
                        target: "cc.actor.channel",
                        channel_id = %channel_id,
                        member = %member,
                        "Resync snapshot queued for member"
                    );
                    false
                }
                Err(_) => true,
            }
        });
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::actors::messages::ConnectionMessage;
    use crate::arbiter::ArbiterError;
    use common::protocol::PresenceKind;
    use std::time::Duration;

    struct Member {
        id: ParticipantId,
        outbox: mpsc::Receiver<ConnectionMessage>,
    }

    impl Member {
        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(ConnectionMessage::Deliver { event }) = self.outbox.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn spawn_channel(max_members: usize) -> (ChannelActorHandle, JoinHandle<()>) {
        ChannelActor::spawn(
            ChannelId::new("demo"),
            max_members,
            CancellationToken::new(),
            ActorMetrics::new(),
        )
    }

    async fn join(handle: &ChannelActorHandle, name: &str) -> Member {
        let (connection, outbox) = ConnectionActorHandle::detached(&format!("conn-{name}"), 64);
        let id = ParticipantId::new(name);
        handle.join(id.clone(), connection).await.unwrap();
        Member { id, outbox }
    }

    #[tokio::test]
    async fn test_join_replies_before_presence() {
        let (handle, _task) = spawn_channel(8);

        let mut alice = join(&handle, "alice").await;
        let events = alice.drain();

        assert!(matches!(&events[0], ServerEvent::Joined { holder: None, queue_length: 0, .. }));
        assert!(matches!(
            &events[1],
            ServerEvent::Presence { identity, kind: PresenceKind::Join } if identity == &alice.id
        ));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_identity_is_rejected() {
        let (handle, _task) = spawn_channel(8);
        let _alice = join(&handle, "alice").await;

        let (connection, _outbox) = ConnectionActorHandle::detached("conn-alice-2", 8);
        let err = handle
            .join(ParticipantId::new("alice"), connection)
            .await
            .unwrap_err();
        assert!(matches!(err, CcError::Arbiter(ArbiterError::AlreadyMember)));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_grant_is_broadcast_and_snapshot_published() {
        let (handle, _task) = spawn_channel(8);
        let mut alice = join(&handle, "alice").await;
        let mut bob = join(&handle, "bob").await;
        alice.drain();
        bob.drain();

        handle
            .command(alice.id.clone(), ChannelCommand::RequestControl)
            .await
            .unwrap();
        handle
            .command(bob.id.clone(), ChannelCommand::RequestControl)
            .await
            .unwrap();

        for member in [&mut alice, &mut bob] {
            let events = member.drain();
            assert!(matches!(&events[0], ServerEvent::Granted { identity } if identity.as_str() == "alice"));
            assert!(matches!(&events[1], ServerEvent::QueueUpdated { queue } if queue.len() == 1));
        }

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.holder, Some(alice.id.clone()));
        assert_eq!(snapshot.queue, vec![bob.id.clone()]);
        assert_eq!(snapshot.members.len(), 2);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_rejected_command_changes_nothing() {
        let (handle, _task) = spawn_channel(8);
        let mut alice = join(&handle, "alice").await;
        alice.drain();

        let err = handle
            .command(alice.id.clone(), ChannelCommand::ReleaseControl)
            .await
            .unwrap_err();
        assert!(matches!(err, CcError::Arbiter(ArbiterError::NotHolder)));
        assert!(alice.drain().is_empty(), "rejections are not broadcast");

        handle.cancel();
    }

    #[tokio::test]
    async fn test_holder_leave_hands_over_with_cascade() {
        let (handle, _task) = spawn_channel(8);
        let alice = join(&handle, "alice").await;
        let mut bob = join(&handle, "bob").await;

        handle
            .command(alice.id.clone(), ChannelCommand::RequestControl)
            .await
            .unwrap();
        handle
            .command(bob.id.clone(), ChannelCommand::RequestControl)
            .await
            .unwrap();
        bob.drain();

        handle.leave(alice.id.clone()).await.unwrap();

        let names: Vec<&str> = bob.drain().iter().map(ServerEvent::name).collect();
        assert_eq!(
            names,
            vec!["collab:allow", "collab:close", "granted", "queueUpdated", "presence"]
        );
        assert_eq!(handle.snapshot().holder, Some(bob.id.clone()));

        // Leaving twice is harmless
        handle.leave(alice.id.clone()).await.unwrap();
        assert!(bob.drain().is_empty());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_relay_reaches_only_target() {
        let (handle, _task) = spawn_channel(8);
        let mut alice = join(&handle, "alice").await;
        let mut bob = join(&handle, "bob").await;
        let mut carol = join(&handle, "carol").await;
        for m in [&mut alice, &mut bob, &mut carol] {
            m.drain();
        }

        handle
            .relay(
                alice.id.clone(),
                bob.id.clone(),
                serde_json::json!({"sdp": "offer"}),
            )
            .await
            .unwrap();
        handle
            .relay(
                alice.id.clone(),
                ParticipantId::new("nobody"),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        // Barrier: a no-op command is processed after both relays
        handle
            .command(carol.id.clone(), ChannelCommand::WithdrawControl)
            .await
            .unwrap();

        let events = bob.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ServerEvent::Signal { from_identity, payload }
                if from_identity == &alice.id && payload["sdp"] == "offer"
        ));
        assert!(carol.drain().is_empty());
        assert!(alice.drain().is_empty());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_full_outbound_queue_does_not_block_channel() {
        let (handle, _task) = spawn_channel(8);
        let (slow_conn, _slow_outbox) = ConnectionActorHandle::detached("conn-slow", 1);
        handle
            .join(ParticipantId::new("slow"), slow_conn)
            .await
            .unwrap();
        let mut alice = join(&handle, "alice").await;
        alice.drain();

        // "slow" already has a full queue; the commit still succeeds
        handle
            .command(alice.id.clone(), ChannelCommand::RequestControl)
            .await
            .unwrap();
        assert!(matches!(&alice.drain()[0], ServerEvent::Granted { .. }));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_member_that_missed_events_gets_snapshot() {
        let (handle, _task) = spawn_channel(8);
        let (slow_conn, mut slow_outbox) = ConnectionActorHandle::detached("conn-slow", 1);
        handle
            .join(ParticipantId::new("slow"), slow_conn)
            .await
            .unwrap();
        let alice = join(&handle, "alice").await;

        // "slow" holds only its joined reply; presence and the grant are lost
        handle
            .command(alice.id.clone(), ChannelCommand::RequestControl)
            .await
            .unwrap();

        assert!(matches!(
            slow_outbox.recv().await,
            Some(ConnectionMessage::Deliver { event: ServerEvent::Joined { .. } })
        ));

        let next = tokio::time::timeout(Duration::from_secs(2), slow_outbox.recv())
            .await
            .expect("stale member should be resynced once its queue has room");
        match next {
            Some(ConnectionMessage::Deliver {
                event: ServerEvent::Snapshot(snapshot),
            }) => {
                assert_eq!(snapshot.holder, Some(alice.id.clone()));
                assert_eq!(snapshot.members.len(), 2);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        // One resync per gap
        let extra = tokio::time::timeout(Duration::from_millis(600), slow_outbox.recv()).await;
        assert!(extra.is_err(), "no further snapshots once caught up");

        handle.cancel();
    }

    #[tokio::test]
    async fn test_try_close_only_when_empty() {
        let (handle, task) = spawn_channel(8);
        let alice = join(&handle, "alice").await;

        assert!(!handle.try_close().await.unwrap());

        handle.leave(alice.id.clone()).await.unwrap();
        assert!(handle.try_close().await.unwrap());

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok(), "closed channel should stop");

        let (connection, _outbox) = ConnectionActorHandle::detached("conn-late", 8);
        let err = handle
            .join(ParticipantId::new("late"), connection)
            .await
            .unwrap_err();
        assert!(matches!(err, CcError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_channel_full() {
        let (handle, _task) = spawn_channel(1);
        let _alice = join(&handle, "alice").await;

        let (connection, _outbox) = ConnectionActorHandle::detached("conn-bob", 8);
        let err = handle
            .join(ParticipantId::new("bob"), connection)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), 7);

        handle.cancel();
    }
}
