//! Channel Controller (CC) Service Library
//!
//! Arbitrates control of named channels: one participant at a time holds a
//! channel's primary output slot, others wait in a FIFO queue, and the holder
//! can open a secondary "collab" slot for one collaborator.
//!
//! # Architecture
//!
//! ```text
//! ChannelRegistryActor (singleton)
//! └── ChannelActor (one per channel, owns ChannelState)
//!     └── ConnectionActor (one per WebSocket, outbound half)
//! ```
//!
//! # Modules
//!
//! - [`arbiter`] - pure arbitration state machine
//! - [`actors`] - actor hierarchy around the state machine
//! - [`transport`] - WebSocket read loop
//! - [`routes`] - Axum router (`/ws`, `/health`, `/ready`, `/metrics`)
//! - [`config`] - configuration from environment
//! - [`errors`] - error types with rejection codes
//! - [`observability`] - health state and Prometheus metrics

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actors;
pub mod arbiter;
pub mod config;
pub mod errors;
pub mod observability;
pub mod routes;
pub mod transport;
