//! Common identifiers and wire types shared across Audio Arcade components.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for channel, participant and attachment identifiers
pub mod types;

/// Module for the control-plane wire protocol (client and server events)
pub mod protocol;

/// Module for resolving participant identity from join requests
pub mod identity;
