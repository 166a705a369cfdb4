//! Control connection to a Channel Controller.
//!
//! The socket is split into a writer task fed by an unbounded queue and a
//! reader task that decodes server events into another queue. A heartbeat
//! task sends `ping` so an idle participant is not timed out by the server.

use crate::error::ClientError;
use common::protocol::{encode, ClientEvent, ServerEvent};
use common::types::{ChannelId, ParticipantId};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Default interval between keep-alive pings. Well under the server's
/// default idle timeout.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Default time to wait for the `joined` reply.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection options.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Interval between keep-alive pings. `None` disables the heartbeat.
    pub ping_interval: Option<Duration>,
    /// Time to wait for the `joined` reply.
    pub join_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Channel state returned by a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedChannel {
    pub channel_id: ChannelId,
    pub identity: ParticipantId,
    pub holder: Option<ParticipantId>,
    pub queue: Vec<ParticipantId>,
    pub collab_allowed: bool,
    pub collab_occupant: Option<ParticipantId>,
}

/// Client side of one control connection.
pub struct ControlClient {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    inbound: mpsc::UnboundedReceiver<ServerEvent>,
    cancel_token: CancellationToken,
    writer: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl ControlClient {
    /// Connect with default options.
    ///
    /// # Errors
    ///
    /// Returns `Connect` if the WebSocket handshake fails.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        Self::connect_with(url, ClientOptions::default()).await
    }

    /// Connect to `url` (for example `ws://127.0.0.1:8787/ws`).
    ///
    /// # Errors
    ///
    /// Returns `Connect` if the WebSocket handshake fails.
    pub async fn connect_with(url: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Connect(format!("websocket connect failed: {e}")))?;
        tracing::debug!(target: "cc.client", url = %url, "Control connection established");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerEvent>();
        let cancel_token = CancellationToken::new();

        let writer_token = cancel_token.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_token.cancelled() => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                    event = outbound_rx.recv() => {
                        let Some(event) = event else { break };
                        let text = match encode(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!(target: "cc.client", error = %e, "Failed to encode event");
                                continue;
                            }
                        };
                        if let Err(e) = ws_write.send(Message::Text(text)).await {
                            tracing::debug!(target: "cc.client", error = %e, "Control connection write failed");
                            break;
                        }
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerEvent::decode(&text) {
                        Ok(event) => {
                            tracing::trace!(target: "cc.client", event = event.name(), "Received event");
                            if inbound_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(target: "cc.client", error = %e, "Ignoring undecodable frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(target: "cc.client", frame = ?frame, "Server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(target: "cc.client", error = %e, "Control connection read failed");
                        break;
                    }
                }
            }
        });

        let heartbeat = options.ping_interval.map(|period| {
            let heartbeat_tx = outbound.clone();
            let heartbeat_token = cancel_token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                // First tick completes immediately
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = heartbeat_token.cancelled() => break,
                        _ = ticker.tick() => {
                            if heartbeat_tx.send(ClientEvent::Ping).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        });

        Ok(Self {
            outbound,
            inbound,
            cancel_token,
            writer: Some(writer),
            reader,
            heartbeat,
            join_timeout: options.join_timeout,
        })
    }

    /// Queue an event for the server.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the connection is gone.
    pub fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        if self.cancel_token.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.outbound.send(event).map_err(|_| ClientError::Closed)
    }

    /// Wait for the next server event. Returns `None` once the connection
    /// is closed and every received event has been consumed.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.inbound.recv().await
    }

    /// Join `channel_id` as `identity` and wait for the `joined` reply.
    ///
    /// Events that arrive before the reply are discarded.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if the server refuses the join, `Timeout` if no
    /// reply arrives in time, or `Closed` if the connection drops.
    pub async fn join(
        &mut self,
        channel_id: &ChannelId,
        identity: &ParticipantId,
    ) -> Result<JoinedChannel, ClientError> {
        self.send(ClientEvent::Join {
            channel_id: channel_id.clone(),
            identity: Some(identity.to_string()),
            token: None,
        })?;

        let join_timeout = self.join_timeout;
        let wait = async {
            loop {
                match self.next_event().await {
                    Some(ServerEvent::Joined {
                        channel_id,
                        identity,
                        holder,
                        queue,
                        collab_allowed,
                        collab_occupant,
                        ..
                    }) => {
                        return Ok(JoinedChannel {
                            channel_id,
                            identity,
                            holder,
                            queue,
                            collab_allowed,
                            collab_occupant,
                        })
                    }
                    Some(ServerEvent::Rejected {
                        action,
                        code,
                        reason,
                    }) if action == "join" => {
                        return Err(ClientError::Rejected {
                            action,
                            code,
                            reason,
                        })
                    }
                    Some(other) => {
                        tracing::trace!(target: "cc.client", event = other.name(), "Skipping event before joined");
                    }
                    None => return Err(ClientError::Closed),
                }
            }
        };

        tokio::time::timeout(join_timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout("joined"))?
    }

    /// Send a close frame and wait briefly for the writer to flush it.
    pub async fn close(mut self) {
        self.cancel_token.cancel();
        if let Some(writer) = self.writer.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        }
        tracing::debug!(target: "cc.client", "Control connection closed");
    }

    /// Returns true while the reader is still receiving.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished() && !self.cancel_token.is_cancelled()
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        // The writer sees the cancellation and sends its close frame on its own
        self.cancel_token.cancel();
        self.reader.abort();
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
    }
}
