//! Observability for the Channel Controller.
//!
//! Logs use `tracing` with one target per component. Metric labels never
//! carry channel names or identities.
//!
//! | Target | Component |
//! |--------|-----------|
//! | `cc.actor.registry` | `ChannelRegistryActor` |
//! | `cc.actor.channel` | `ChannelActor` |
//! | `cc.actor.connection` | `ConnectionActor` |
//! | `cc.actor.mailbox` | mailbox depth warnings |
//! | `cc.transport.ws` | WebSocket read loop |
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `cc_channels_active` | Gauge | none | Live channel actors |
//! | `cc_connections_active` | Gauge | none | Open WebSocket connections |
//! | `cc_grants_total` | Counter | `reason` | Primary-slot grants |
//! | `cc_actions_rejected_total` | Counter | `action` | Refused requests |
//! | `cc_relay_dropped_total` | Counter | none | Signals with no target |
//! | `cc_broadcast_dropped_total` | Counter | none | Events lost to full outbound queues |
//! | `cc_message_latency_seconds` | Histogram | `message_type` | Client event handling time |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
