//! WebSocket control transport.
//!
//! One socket carries one participant. The read loop in this module decodes
//! `ClientEvent`s, enforces join-before-anything and the joined channel, and
//! forwards work to the channel actor. The write half belongs to a
//! `ConnectionActor` so that replies and broadcasts share one ordered queue.
//!
//! A connection that sends nothing for the idle timeout is treated as
//! disconnected. Every exit path (close frame, socket error, idle timeout,
//! shutdown) runs the same leave.

use crate::actors::{ChannelActorHandle, ChannelCommand, ConnectionActor, ConnectionActorHandle};
use crate::errors::CcError;
use crate::observability::metrics as prom;
use crate::routes::AppState;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use common::error::ProtocolError;
use common::identity::resolve_identity;
use common::protocol::{ClientEvent, ServerEvent};
use common::types::{ChannelId, ParticipantId};
use futures_util::{Sink, Stream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Action label for frames that could not be decoded.
const UNKNOWN_ACTION: &str = "unknown";

/// `GET /ws` - upgrade to the control protocol.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sink, stream) = socket.split();
    serve_connection(state, sink, stream).await;
}

/// Drive one connection until it closes, times out or the server stops.
pub async fn serve_connection<Si, St>(state: Arc<AppState>, sink: Si, mut stream: St)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: std::fmt::Display,
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
    let shutdown = state.registry.child_token();
    let (connection, _writer) = ConnectionActor::spawn(
        connection_id.clone(),
        sink,
        state.config.outbound_buffer,
        shutdown.child_token(),
        Arc::clone(&state.metrics),
    );
    state.metrics.connection_opened();

    debug!(
        target: "cc.transport.ws",
        connection_id = %connection_id,
        "Connection opened"
    );

    let idle_timeout = state.config.idle_timeout;
    let mut session = Session {
        state,
        connection,
        membership: None,
    };

    let exit_reason = loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break "shutdown",
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };

        match next {
            Err(_) => break "idle_timeout",
            Ok(None) => break "closed",
            Ok(Some(Err(e))) => {
                warn!(
                    target: "cc.transport.ws",
                    connection_id = %connection_id,
                    error = %e,
                    "Socket read failed"
                );
                break "error";
            }
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => session.handle_frame(&text).await,
                Message::Binary(_) => {
                    let err = CcError::Protocol(ProtocolError::Malformed(
                        "binary frames are not supported".to_string(),
                    ));
                    session.reject(UNKNOWN_ACTION, &err).await;
                }
                Message::Close(_) => break "closed",
                // Transport-level keepalives still count as activity
                Message::Ping(_) | Message::Pong(_) => {}
            },
        }
    };

    info!(
        target: "cc.transport.ws",
        connection_id = %connection_id,
        reason = exit_reason,
        "Connection ending"
    );

    session.finish(exit_reason).await;
}

struct Membership {
    channel_id: ChannelId,
    participant: ParticipantId,
    channel: ChannelActorHandle,
}

struct Session {
    state: Arc<AppState>,
    connection: ConnectionActorHandle,
    membership: Option<Membership>,
}

impl Session {
    async fn handle_frame(&mut self, text: &str) {
        let started = Instant::now();

        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                self.reject(UNKNOWN_ACTION, &CcError::from(e)).await;
                return;
            }
        };

        let action = event.name();
        if let Err(err) = self.dispatch(event).await {
            self.reject(action, &err).await;
        }

        prom::record_message_latency(action, started.elapsed());
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(), CcError> {
        match event {
            ClientEvent::Ping => self.connection.deliver(ServerEvent::Pong).await,

            ClientEvent::Join {
                channel_id,
                identity,
                token,
            } => self.join(channel_id, identity.as_deref(), token.as_deref()).await,

            event => {
                let membership = self.membership.as_ref().ok_or(CcError::NotJoined)?;
                if event.channel_id() != Some(&membership.channel_id) {
                    return Err(CcError::ChannelMismatch);
                }
                let participant = membership.participant.clone();

                match event {
                    ClientEvent::Snapshot { .. } => {
                        let snapshot = membership.channel.snapshot();
                        self.connection
                            .deliver(ServerEvent::Snapshot(snapshot))
                            .await
                    }
                    ClientEvent::Signal {
                        to_identity,
                        payload,
                        ..
                    } => {
                        membership
                            .channel
                            .relay(participant, to_identity, payload)
                            .await
                    }
                    other => match command_for(&other) {
                        Some(command) => membership.channel.command(participant, command).await,
                        None => Ok(()),
                    },
                }
            }
        }
    }

    async fn join(
        &mut self,
        channel_id: ChannelId,
        identity: Option<&str>,
        token: Option<&str>,
    ) -> Result<(), CcError> {
        if self.membership.is_some() {
            return Err(CcError::AlreadyJoined);
        }

        let participant = resolve_identity(identity, token)?;

        let mut retried = false;
        let channel = loop {
            let channel = self
                .state
                .registry
                .get_or_create(channel_id.clone())
                .await?;

            match channel
                .join(participant.clone(), self.connection.clone())
                .await
            {
                Ok(()) => break channel,
                // Lost a race with the empty-channel close; the registry has
                // already dropped that actor
                Err(CcError::ChannelClosed) if !retried => retried = true,
                Err(e) => return Err(e),
            }
        };

        info!(
            target: "cc.transport.ws",
            connection_id = %self.connection.connection_id(),
            channel_id = %channel_id,
            participant = %participant,
            "Participant joined"
        );

        self.membership = Some(Membership {
            channel_id,
            participant,
            channel,
        });
        Ok(())
    }

    async fn reject(&self, action: &str, err: &CcError) {
        prom::record_action_rejected(action);

        debug!(
            target: "cc.transport.ws",
            connection_id = %self.connection.connection_id(),
            action = action,
            code = err.error_code(),
            error = %err,
            "Action rejected"
        );

        let event = ServerEvent::Rejected {
            action: action.to_string(),
            code: err.error_code(),
            reason: err.client_message(),
        };
        let _ = self.connection.deliver(event).await;
    }

    async fn finish(mut self, reason: &str) {
        if let Some(membership) = self.membership.take() {
            if let Err(e) = membership.channel.leave(membership.participant.clone()).await {
                debug!(
                    target: "cc.transport.ws",
                    channel_id = %membership.channel_id,
                    error = %e,
                    "Leave after disconnect failed"
                );
            }
            if let Err(e) = self
                .state
                .registry
                .channel_vacated(membership.channel_id.clone())
                .await
            {
                debug!(
                    target: "cc.transport.ws",
                    channel_id = %membership.channel_id,
                    error = %e,
                    "Registry unavailable after leave"
                );
            }
        }

        if self.connection.close(reason).await.is_err() {
            self.connection.cancel();
        }
        self.state.metrics.connection_closed();
    }
}

fn command_for(event: &ClientEvent) -> Option<ChannelCommand> {
    match event {
        ClientEvent::RequestControl { .. } => Some(ChannelCommand::RequestControl),
        ClientEvent::ReleaseControl { .. } => Some(ChannelCommand::ReleaseControl),
        ClientEvent::WithdrawControl { .. } => Some(ChannelCommand::WithdrawControl),
        ClientEvent::CollabAllow { allowed, .. } => Some(ChannelCommand::SetCollabAllowed(*allowed)),
        ClientEvent::CollabOccupy { .. } => Some(ChannelCommand::OccupyCollab),
        ClientEvent::CollabVacate { .. } => Some(ChannelCommand::VacateCollab),
        ClientEvent::Join { .. }
        | ClientEvent::Snapshot { .. }
        | ClientEvent::Signal { .. }
        | ClientEvent::Ping => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, ChannelRegistryHandle};
    use crate::config::Config;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::{CancellationToken, PollSender};

    /// In-memory socket: frames pushed into `inbound` are read by the
    /// session; frames it writes come out of `outbound`.
    struct TestSocket {
        inbound: mpsc::UnboundedSender<Result<Message, axum::Error>>,
        outbound: mpsc::Receiver<Message>,
    }

    impl TestSocket {
        fn send(&self, frame: &str) {
            self.inbound
                .send(Ok(Message::Text(frame.to_string())))
                .unwrap();
        }

        async fn next_event(&mut self) -> ServerEvent {
            loop {
                match self.outbound.recv().await.expect("socket closed") {
                    Message::Text(text) => return ServerEvent::decode(&text).unwrap(),
                    Message::Close(_) => panic!("unexpected close frame"),
                    _ => {}
                }
            }
        }
    }

    fn test_state(idle_seconds: u64) -> Arc<AppState> {
        let vars = HashMap::from([(
            "CC_IDLE_TIMEOUT_SECONDS".to_string(),
            idle_seconds.to_string(),
        )]);
        let config = Config::from_vars(&vars).unwrap();
        let metrics = ActorMetrics::new();
        let (registry, _task) = ChannelRegistryHandle::spawn(
            "cc-test".to_string(),
            config.max_channels,
            config.max_members_per_channel,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        Arc::new(AppState {
            config,
            registry,
            metrics,
        })
    }

    fn connect(state: &Arc<AppState>) -> (TestSocket, tokio::task::JoinHandle<()>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let stream = futures_util::stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let task = tokio::spawn(serve_connection(
            Arc::clone(state),
            PollSender::new(outbound_tx),
            Box::pin(stream),
        ));
        (
            TestSocket {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
            task,
        )
    }

    fn rejection(event: &ServerEvent) -> (&str, i32, &str) {
        match event {
            ServerEvent::Rejected {
                action,
                code,
                reason,
            } => (action.as_str(), *code, reason.as_str()),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_before_join_is_answered() {
        let state = test_state(60);
        let (mut socket, _task) = connect(&state);

        socket.send(r#"{"type":"ping"}"#);
        assert_eq!(socket.next_event().await, ServerEvent::Pong);
    }

    #[tokio::test]
    async fn test_events_before_join_are_unauthorized() {
        let state = test_state(60);
        let (mut socket, _task) = connect(&state);

        socket.send(r#"{"type":"requestControl","channelId":"demo"}"#);
        let event = socket.next_event().await;
        assert_eq!(rejection(&event), ("requestControl", 2, "not_joined"));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_bad_request() {
        let state = test_state(60);
        let (mut socket, _task) = connect(&state);

        socket.send("not json");
        let event = socket.next_event().await;
        assert_eq!(rejection(&event), ("unknown", 1, "malformed_frame"));
    }

    #[tokio::test]
    async fn test_join_without_identity_is_unauthorized() {
        let state = test_state(60);
        let (mut socket, _task) = connect(&state);

        socket.send(r#"{"type":"join","channelId":"demo"}"#);
        let event = socket.next_event().await;
        assert_eq!(rejection(&event), ("join", 2, "no_identity"));
    }

    #[tokio::test]
    async fn test_join_then_request_and_mismatch() {
        let state = test_state(60);
        let (mut socket, _task) = connect(&state);

        socket.send(r#"{"type":"join","channelId":"demo","identity":"alice"}"#);
        assert!(matches!(socket.next_event().await, ServerEvent::Joined { .. }));
        assert!(matches!(socket.next_event().await, ServerEvent::Presence { .. }));

        socket.send(r#"{"type":"requestControl","channelId":"demo"}"#);
        assert!(matches!(
            socket.next_event().await,
            ServerEvent::Granted { identity } if identity.as_str() == "alice"
        ));

        socket.send(r#"{"type":"requestControl","channelId":"other"}"#);
        let event = socket.next_event().await;
        assert_eq!(rejection(&event), ("requestControl", 1, "channel_mismatch"));

        socket.send(r#"{"type":"join","channelId":"demo","identity":"alice"}"#);
        let event = socket.next_event().await;
        assert_eq!(rejection(&event), ("join", 5, "already_joined"));

        socket.send(r#"{"type":"snapshot","channelId":"demo"}"#);
        match socket.next_event().await {
            ServerEvent::Snapshot(snapshot) => {
                assert_eq!(snapshot.holder.as_ref().map(ParticipantId::as_str), Some("alice"));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_treated_as_disconnect() {
        let state = test_state(5);
        let (mut alice, alice_task) = connect(&state);
        let (mut bob, _bob_task) = connect(&state);

        alice.send(r#"{"type":"join","channelId":"demo","identity":"alice"}"#);
        alice.next_event().await;
        alice.next_event().await;
        alice.send(r#"{"type":"requestControl","channelId":"demo"}"#);
        alice.next_event().await;

        bob.send(r#"{"type":"join","channelId":"demo","identity":"bob"}"#);
        bob.next_event().await; // joined
        bob.next_event().await; // presence
        bob.send(r#"{"type":"requestControl","channelId":"demo"}"#);
        bob.next_event().await; // queueUpdated

        // Bob keeps pinging; Alice goes silent
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            bob.send(r#"{"type":"ping"}"#);
            let mut saw_pong = false;
            while !saw_pong {
                if bob.next_event().await == ServerEvent::Pong {
                    saw_pong = true;
                }
            }
        }

        tokio::time::timeout(Duration::from_secs(10), alice_task)
            .await
            .expect("idle session should end")
            .unwrap();

        let snapshot = state
            .registry
            .get_or_create(ChannelId::new("demo"))
            .await
            .unwrap()
            .snapshot();
        assert_eq!(snapshot.holder.as_ref().map(ParticipantId::as_str), Some("bob"));
        assert_eq!(snapshot.members.len(), 1);
    }

    #[tokio::test]
    async fn test_close_frame_runs_leave() {
        let state = test_state(60);
        let (mut socket, task) = connect(&state);

        socket.send(r#"{"type":"join","channelId":"solo","identity":"alice"}"#);
        socket.next_event().await;
        socket.inbound.send(Ok(Message::Close(None))).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        // Registry dropped the empty channel
        let status = state.registry.get_status().await.unwrap();
        assert_eq!(status.channel_count, 0);
    }

    #[test]
    fn test_command_mapping() {
        let demo = ChannelId::new("demo");
        assert_eq!(
            command_for(&ClientEvent::CollabAllow {
                channel_id: demo.clone(),
                allowed: false
            }),
            Some(ChannelCommand::SetCollabAllowed(false))
        );
        assert_eq!(
            command_for(&ClientEvent::Snapshot { channel_id: demo }),
            None
        );
        assert_eq!(command_for(&ClientEvent::Ping), None);
    }
}
