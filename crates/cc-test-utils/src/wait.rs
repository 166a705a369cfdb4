//! Wait helpers
//!
//! Event streams in these tests are asynchronous, so assertions wait for the
//! first event (or view) that matches instead of assuming an exact arrival
//! order across connections.

use channel_client::{ChannelParticipant, ControlClient, MediaSession, ParticipantUpdate};
use common::protocol::ServerEvent;
use std::time::Duration;

/// Default time a helper waits before failing the test.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Wait for the first server event matching `predicate`, discarding others.
pub async fn next_matching<F>(
    client: &mut ControlClient,
    predicate: F,
) -> Result<ServerEvent, anyhow::Error>
where
    F: Fn(&ServerEvent) -> bool,
{
    let mut skipped = Vec::new();
    let wait = async {
        while let Some(event) = client.next_event().await {
            if predicate(&event) {
                return Some(event);
            }
            skipped.push(event.name());
        }
        None
    };

    let outcome = tokio::time::timeout(DEFAULT_WAIT, wait).await;
    match outcome {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(anyhow::anyhow!(
            "connection closed before a matching event (skipped {:?})",
            skipped
        )),
        Err(_) => Err(anyhow::anyhow!(
            "timed out waiting for a matching event (skipped {:?})",
            skipped
        )),
    }
}

/// Collect the next `count` server events in arrival order.
pub async fn next_events(
    client: &mut ControlClient,
    count: usize,
) -> Result<Vec<ServerEvent>, anyhow::Error> {
    let mut events = Vec::with_capacity(count);
    while events.len() < count {
        match tokio::time::timeout(DEFAULT_WAIT, client.next_event()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => anyhow::bail!("connection closed after {} events", events.len()),
            Err(_) => anyhow::bail!("timed out after {} events: {:?}", events.len(), events),
        }
    }
    Ok(events)
}

/// Drive a participant until an update matches `predicate`.
pub async fn next_update_matching<M, F>(
    participant: &mut ChannelParticipant<M>,
    predicate: F,
) -> Result<ParticipantUpdate, anyhow::Error>
where
    M: MediaSession,
    F: Fn(&ParticipantUpdate) -> bool,
{
    let wait = async {
        loop {
            match participant.next_update().await {
                Ok(update) if predicate(&update) => return Ok(update),
                Ok(_) => {}
                Err(e) => return Err(anyhow::Error::from(e)),
            }
        }
    };
    tokio::time::timeout(DEFAULT_WAIT, wait)
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for a matching update"))?
}

/// Drive a participant until its view satisfies `predicate`. Returns at
/// once if it already does.
pub async fn wait_for_view<M, F>(
    participant: &mut ChannelParticipant<M>,
    predicate: F,
) -> Result<(), anyhow::Error>
where
    M: MediaSession,
    F: Fn(&channel_client::SlotView) -> bool,
{
    if predicate(&participant.view()) {
        return Ok(());
    }
    next_update_matching(participant, |update| predicate(&update.view))
        .await
        .map(|_| ())
}
