//! Actor hierarchy for the Channel Controller.
//!
//! ```text
//! ChannelRegistryActor (singleton)
//! └── supervises N ChannelActors
//!     └── ChannelActor (one per live channel)
//!         ├── owns ChannelState
//!         └── fans out to N ConnectionActors
//!             └── ConnectionActor (one per WebSocket, outbound half)
//! ```
//!
//! All communication is `tokio::sync::mpsc` message passing. Cancellation
//! flows from the registry's root token to every channel.

pub mod channel;
pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;

pub use channel::{ChannelActor, ChannelActorHandle};
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::{ChannelCommand, ConnectionMessage, RegistryStatus};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{ChannelRegistryActor, ChannelRegistryHandle};
