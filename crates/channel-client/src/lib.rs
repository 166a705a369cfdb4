//! Client side of Audio Arcade channel control.
//!
//! - [`client::ControlClient`]: WebSocket control connection with keep-alive
//! - [`projector::SlotProjector`]: local derivation of the slot view
//! - [`media::MediaSession`]: seam to the media transport
//! - [`participant::ChannelParticipant`]: the user actions of a channel screen

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod error;
pub mod media;
pub mod participant;
pub mod projector;

pub use client::{ClientOptions, ControlClient, JoinedChannel};
pub use error::ClientError;
pub use media::{MediaEvent, MediaSession};
pub use participant::{ChannelParticipant, ParticipantUpdate, UpdateTrigger};
pub use projector::{ProjectorEffect, ProjectorInput, SlotProjector, SlotView};
