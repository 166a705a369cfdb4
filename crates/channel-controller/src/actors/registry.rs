//! `ChannelRegistryActor` - singleton that maps channel names to actors.
//!
//! - Creates a `ChannelActor` on the first join to an unseen name
//! - Closes and drops channels once their last member leaves
//! - Owns the root `CancellationToken`; every channel gets a child token
//! - Detects channel actor panics via `JoinHandle`
//!
//! # Graceful Shutdown
//!
//! On `Shutdown` the registry stops creating channels, cancels the root
//! token and waits (bounded) for every channel task to finish.

use crate::errors::CcError;

use super::channel::{ChannelActor, ChannelActorHandle};
use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::ChannelId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_MAILBOX_BUFFER: usize = 1000;

/// Upper bound on waiting for one channel task during shutdown.
const CHANNEL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `ChannelRegistryActor`.
#[derive(Clone, Debug)]
pub struct ChannelRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl ChannelRegistryHandle {
    /// Spawn the registry actor.
    ///
    /// `cancel_token` becomes the root of the channel token hierarchy.
    #[must_use]
    pub fn spawn(
        instance_id: String,
        max_channels: usize,
        max_members_per_channel: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_MAILBOX_BUFFER);

        let mailbox = MailboxMonitor::new(ActorType::Registry, &instance_id);
        let actor = ChannelRegistryActor {
            instance_id,
            max_channels,
            max_members_per_channel,
            receiver,
            cancel_token: cancel_token.clone(),
            channels: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox,
        };

        let task = tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
            },
            task,
        )
    }

    /// Look up a channel, creating it if unseen.
    ///
    /// # Errors
    ///
    /// `Draining` during shutdown, `CapacityExceeded` at the channel limit,
    /// `Internal` if the registry has stopped.
    pub async fn get_or_create(&self, channel_id: ChannelId) -> Result<ChannelActorHandle, CcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreate {
                channel_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Tell the registry a member left `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns `CcError::Internal` if the registry has stopped.
    pub async fn channel_vacated(&self, channel_id: ChannelId) -> Result<(), CcError> {
        self.sender
            .send(RegistryMessage::ChannelVacated { channel_id })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))
    }

    /// Current registry status.
    ///
    /// # Errors
    ///
    /// Returns `CcError::Internal` if the registry has stopped.
    pub async fn get_status(&self) -> Result<RegistryStatus, CcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown.
    ///
    /// # Errors
    ///
    /// Returns `CcError::Internal` if the registry has already stopped.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), CcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the registry and every channel (immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for per-connection work that should stop with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ManagedChannel {
    handle: ChannelActorHandle,
    task_handle: JoinHandle<()>,
    created_at: i64,
}

/// The `ChannelRegistryActor` implementation.
pub struct ChannelRegistryActor {
    instance_id: String,
    max_channels: usize,
    max_members_per_channel: usize,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    channels: HashMap<ChannelId, ManagedChannel>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ChannelRegistryActor {
    #[instrument(skip_all, name = "cc.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "cc.actor.registry",
            instance_id = %self.instance_id,
            max_channels = self.max_channels,
            "ChannelRegistryActor started"
        );

        loop {
            self.check_channel_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cc.actor.registry",
                        instance_id = %self.instance_id,
                        "ChannelRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown(CHANNEL_SHUTDOWN_TIMEOUT).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_receive(self.receiver.len());
                            self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "cc.actor.registry",
                                instance_id = %self.instance_id,
                                "ChannelRegistryActor mailbox closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cc.actor.registry",
            instance_id = %self.instance_id,
            channels_remaining = self.channels.len(),
            messages_processed = self.mailbox.messages_processed(),
            "ChannelRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreate {
                channel_id,
                respond_to,
            } => {
                let result = self.get_or_create(channel_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::ChannelVacated { channel_id } => {
                self.close_if_empty(&channel_id).await;
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                info!(
                    target: "cc.actor.registry",
                    instance_id = %self.instance_id,
                    channel_count = self.channels.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.graceful_shutdown(deadline).await;
                let _ = respond_to.send(Ok(()));
                self.cancel_token.cancel();
            }
        }
    }

    fn get_or_create(&mut self, channel_id: ChannelId) -> Result<ChannelActorHandle, CcError> {
        if !self.accepting_new {
            return Err(CcError::Draining);
        }

        if let Some(managed) = self.channels.get(&channel_id) {
            return Ok(managed.handle.clone());
        }

        if self.channels.len() >= self.max_channels {
            warn!(
                target: "cc.actor.registry",
                instance_id = %self.instance_id,
                max_channels = self.max_channels,
                "Channel limit reached, refusing new channel"
            );
            return Err(CcError::CapacityExceeded);
        }

        let (handle, task_handle) = ChannelActor::spawn(
            channel_id.clone(),
            self.max_members_per_channel,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.channels.insert(
            channel_id.clone(),
            ManagedChannel {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.channel_created();

        info!(
            target: "cc.actor.registry",
            instance_id = %self.instance_id,
            channel_id = %channel_id,
            total_channels = self.channels.len(),
            "Channel created"
        );

        Ok(handle)
    }

    async fn close_if_empty(&mut self, channel_id: &ChannelId) {
        let Some(managed) = self.channels.get(channel_id) else {
            return;
        };

        let closed = managed.handle.try_close().await.unwrap_or(true);
        if !closed {
            return;
        }

        if let Some(managed) = self.channels.remove(channel_id) {
            self.metrics.channel_removed();
            info!(
                target: "cc.actor.registry",
                instance_id = %self.instance_id,
                channel_id = %channel_id,
                lifetime_seconds = chrono::Utc::now().timestamp() - managed.created_at,
                total_channels = self.channels.len(),
                "Channel closed"
            );
        }
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            channel_count: self.channels.len(),
            connection_count: self.metrics.connection_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self, deadline: Duration) {
        self.accepting_new = false;

        for managed in self.channels.values() {
            managed.handle.cancel();
        }

        for (channel_id, managed) in self.channels.drain() {
            match tokio::time::timeout(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "cc.actor.registry",
                        channel_id = %channel_id,
                        "Channel actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "cc.actor.registry",
                        channel_id = %channel_id,
                        error = ?e,
                        "Channel actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "cc.actor.registry",
                        channel_id = %channel_id,
                        "Channel actor shutdown timed out"
                    );
                }
            }
            self.metrics.channel_removed();
        }

        info!(
            target: "cc.actor.registry",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Drop channels whose task ended without a close handshake.
    async fn check_channel_health(&mut self) {
        let finished: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(channel_id, _)| channel_id.clone())
            .collect();

        for channel_id in finished {
            let Some(managed) = self.channels.remove(&channel_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "cc.actor.registry",
                        instance_id = %self.instance_id,
                        channel_id = %channel_id,
                        "Channel actor exited"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "cc.actor.registry",
                        instance_id = %self.instance_id,
                        channel_id = %channel_id,
                        error = ?join_error,
                        "Channel actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Channel);
                }
                Err(_) => {}
            }

            self.metrics.channel_removed();
        }
    }
}
