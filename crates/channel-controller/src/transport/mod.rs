//! Client-facing transports.

pub mod ws;

pub use ws::{serve_connection, ws_handler};
