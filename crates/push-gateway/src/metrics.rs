//! Prometheus metrics for the push gateway.
//!
//! Recording is always safe: before `init_metrics` runs (as in unit tests) the
//! `metrics` macros go to a no-op recorder.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use crate::connection::TeardownReason;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("Failed to set global metrics recorder (already set)");
        return false;
    }

    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("Failed to store Prometheus handle (already set)");
    }

    describe_metrics();

    tracing::info!("Prometheus metrics initialized");
    true
}

fn describe_metrics() {
    describe_gauge!(
        "push_connections_active",
        "Connections currently registered in the session registry"
    );
    describe_counter!(
        "push_connections_total",
        "Connections accepted since start"
    );
    describe_counter!(
        "push_teardowns_total",
        "Connection teardowns by reason"
    );
    describe_counter!(
        "push_notifications_total",
        "Per-connection push outcomes (delivered, busy, failed, offline)"
    );
    describe_counter!(
        "push_auth_failures_total",
        "Rejected upgrade or push credentials"
    );
}

/// Render current metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

pub fn record_connection_opened() {
    counter!("push_connections_total").increment(1);
    gauge!("push_connections_active").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("push_connections_active").decrement(1.0);
}

pub fn record_teardown(reason: TeardownReason) {
    counter!("push_teardowns_total", "reason" => reason.as_str()).increment(1);
}

/// `outcome` is one of `delivered`, `busy`, `failed`, `offline`.
pub fn record_push(outcome: &'static str) {
    counter!("push_notifications_total", "outcome" => outcome).increment(1);
}

pub fn record_auth_failure(kind: &'static str) {
    counter!("push_auth_failures_total", "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_connection_opened();
        record_teardown(TeardownReason::HeartbeatTimeout);
        record_push("delivered");
        record_auth_failure("missing");
        record_connection_closed();
    }

    #[test]
    fn init_then_render_includes_described_metrics() {
        // Only one test in this binary installs the global recorder.
        init_metrics();
        record_push("offline");
        let text = render_metrics().expect("recorder installed");
        assert!(text.contains("push_notifications_total"));
        assert!(!init_metrics());
    }
}
