//! # CC Test Utilities
//!
//! Shared test utilities for the Channel Controller and its clients.
//!
//! This crate provides:
//! - Server test harness (`TestChannelServer` for E2E tests)
//! - In-memory media room (`MockMediaRoom`) implementing `MediaSession`
//! - Wait helpers (`next_matching`, `wait_for_view`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<()> {
//!     let server = TestChannelServer::spawn().await?;
//!     let mut client = server.connect().await?;
//!     client.join(&ChannelId::new("demo"), &ParticipantId::new("a")).await?;
//!     client.send(ClientEvent::RequestControl { channel_id: ChannelId::new("demo") })?;
//!     let granted = next_matching(&mut client, |e| matches!(e, ServerEvent::Granted { .. })).await?;
//!     Ok(())
//! }
//! ```

pub mod mock_media;
pub mod server_harness;
pub mod wait;

// Re-export commonly used items
pub use mock_media::*;
pub use server_harness::*;
pub use wait::*;
