//! Metrics definitions for the Channel Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cc_` prefix for Channel Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code, never by channel or participant names:
//! - `reason`: 3 values (request, release, disconnect)
//! - `action`: bounded by client event types (~10 values)
//! - `message_type`: bounded by client event types (~10 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Control messages are in-memory hops; p99 should stay well under 10ms
        .set_buckets_for_metric(
            Matcher::Prefix("cc_message".to_string()),
            &[
                0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `cc_channels_active`
pub fn set_channels_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_channels_active").set(count as f64);
}

/// Metric: `cc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_connections_active").set(count as f64);
}

// ============================================================================
// Arbitration counters
// ============================================================================

/// Record a primary-slot grant.
///
/// Metric: `cc_grants_total`
/// Labels: `reason`
pub fn record_grant(reason: &str) {
    counter!("cc_grants_total", "reason" => reason.to_string()).increment(1);
}

/// Record an action rejected back to its requester.
///
/// Metric: `cc_actions_rejected_total`
/// Labels: `action`
pub fn record_action_rejected(action: &str) {
    counter!("cc_actions_rejected_total", "action" => action.to_string()).increment(1);
}

// ============================================================================
// Delivery counters
// ============================================================================

/// Record a relay payload dropped for a missing target.
///
/// Metric: `cc_relay_dropped_total`
pub fn record_relay_dropped() {
    counter!("cc_relay_dropped_total").increment(1);
}

/// Record a broadcast event dropped because a member's outbound queue was full.
///
/// Metric: `cc_broadcast_dropped_total`
pub fn record_broadcast_dropped() {
    counter!("cc_broadcast_dropped_total").increment(1);
}

// ============================================================================
// Latency
// ============================================================================

/// Record client event handling latency.
///
/// Metric: `cc_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("cc_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        set_channels_active(3);
        set_connections_active(7);
        record_grant("request");
        record_action_rejected("releaseControl");
        record_relay_dropped();
        record_broadcast_dropped();
        record_message_latency("requestControl", Duration::from_micros(150));
    }

    #[test]
    fn test_counters_are_emitted_with_bounded_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_grant("request");
            record_grant("release");
            record_grant("release");
            record_action_rejected("collabAllow");
            record_relay_dropped();
            set_channels_active(2);
        });

        let entries = snapshotter.snapshot().into_vec();

        let release_grants = entries.iter().find_map(|(key, _, _, value)| {
            let key = key.key();
            let is_release = key.name() == "cc_grants_total"
                && key
                    .labels()
                    .any(|l| l.key() == "reason" && l.value() == "release");
            is_release.then_some(value)
        });
        assert_eq!(release_grants, Some(&DebugValue::Counter(2)));

        let names: Vec<&str> = entries.iter().map(|(k, _, _, _)| k.key().name()).collect();
        assert!(names.contains(&"cc_actions_rejected_total"));
        assert!(names.contains(&"cc_relay_dropped_total"));
        assert!(names.contains(&"cc_channels_active"));
    }
}
