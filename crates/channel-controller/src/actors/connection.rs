//! `ConnectionActor` - outbound half of one WebSocket.
//!
//! Each `ConnectionActor`:
//! - Owns the write half of exactly one socket
//! - Serializes `ServerEvent`s as JSON text frames in mailbox order
//! - Is fed by the channel actor (broadcasts) and the read loop (replies)
//!
//! Per-member ordering follows from the single mailbox: events are written
//! in the order the channel actor committed them.

use crate::errors::CcError;

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use axum::extract::ws::{CloseFrame, Message};
use common::protocol::{self, ServerEvent};
use futures_util::{Sink, SinkExt};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Close code for a normal, server-initiated close.
const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when the server is shutting down.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Outbound queue monitor, shared with the actor.
    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }

    /// Queue an event without waiting.
    ///
    /// Used for broadcasts so one slow member never stalls a channel.
    ///
    /// # Errors
    ///
    /// Returns `CcError::Internal` if the outbound queue is full or closed.
    /// A full queue is also counted on the mailbox monitor.
    pub fn try_deliver(&self, event: ServerEvent) -> Result<(), CcError> {
        self.sender
            .try_send(ConnectionMessage::Deliver { event })
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    self.mailbox.record_drop();
                    CcError::Internal("outbound queue full".to_string())
                }
                TrySendError::Closed(_) => CcError::Internal("connection closed".to_string()),
            })
    }

    /// True if the outbound queue can take another event right now.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.sender.capacity() > 0
    }

    /// Queue an event, waiting for room.
    ///
    /// # Errors
    ///
    /// Returns `CcError::Internal` if the actor has stopped.
    pub async fn deliver(&self, event: ServerEvent) -> Result<(), CcError> {
        self.sender
            .send(ConnectionMessage::Deliver { event })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))
    }

    /// Send a close frame after any queued events, then stop.
    ///
    /// # Errors
    ///
    /// Returns `CcError::Internal` if the actor has stopped.
    pub async fn close(&self, reason: impl Into<String>) -> Result<(), CcError> {
        self.sender
            .send(ConnectionMessage::Close {
                reason: reason.into(),
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Handle whose mailbox is read directly by the caller instead of an actor.
    #[cfg(test)]
    pub(crate) fn detached(
        connection_id: &str,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<ConnectionMessage>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let handle = Self {
            sender,
            cancel_token: CancellationToken::new(),
            connection_id: connection_id.to_string(),
            mailbox: Arc::new(MailboxMonitor::new(ActorType::Connection, connection_id)),
        };
        (handle, receiver)
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor<S> {
    connection_id: String,
    sink: S,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
    is_closing: bool,
}

impl<S> ConnectionActor<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    /// Spawn a connection actor writing to `sink`.
    ///
    /// `buffer` bounds the outbound queue; broadcasts beyond it are dropped.
    pub fn spawn(
        connection_id: String,
        sink: S,
        buffer: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Connection, &connection_id));

        let actor = Self {
            connection_id: connection_id.clone(),
            sink,
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "cc.actor.connection", fields(connection_id = %self.connection_id))]
    async fn run(mut self) {
        debug!(
            target: "cc.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "cc.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.graceful_close(CLOSE_GOING_AWAY, "server shutting down").await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_receive(self.receiver.len());
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "cc.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cc.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Deliver { event } => !self.write_event(&event).await,
            ConnectionMessage::Close { reason } => {
                self.graceful_close(CLOSE_NORMAL, &reason).await;
                true
            }
        }
    }

    /// Write one event. Returns false once the socket is unusable.
    async fn write_event(&mut self, event: &ServerEvent) -> bool {
        if self.is_closing {
            return false;
        }

        let frame = match protocol::encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                // An unencodable event is a bug, not a reason to drop the socket
                warn!(
                    target: "cc.actor.connection",
                    connection_id = %self.connection_id,
                    event = event.name(),
                    error = %e,
                    "Failed to encode outbound event"
                );
                return true;
            }
        };

        if let Err(e) = self.sink.send(Message::Text(frame)).await {
            debug!(
                target: "cc.actor.connection",
                connection_id = %self.connection_id,
                event = event.name(),
                error = %e,
                "Socket write failed, stopping"
            );
            return false;
        }

        true
    }

    async fn graceful_close(&mut self, code: u16, reason: &str) {
        if self.is_closing {
            return;
        }
        self.is_closing = true;

        debug!(
            target: "cc.actor.connection",
            connection_id = %self.connection_id,
            code = code,
            reason = %reason,
            "Closing connection"
        );

        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        };
        // Peer may already be gone
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        let _ = self.sink.close().await;
    }
}
