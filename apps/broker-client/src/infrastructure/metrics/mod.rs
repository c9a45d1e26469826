//! Prometheus Metrics Module
//!
//! Runtime metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Dispatch**: inbound messages by kind, drops by reason, dispatch latency
//! - **Orders**: submissions by order type, failed order requests by operation
//! - **Session**: connection status gauge, explicit reconnects
//! - **Strategy**: faults by kind
//!
//! Recording is a no-op until [`init_metrics`] installs the recorder, so the
//! library can be used without it. Metrics are exposed at `/metrics` on the
//! health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionStatus;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Dispatch
    describe_counter!(
        "broker_client_messages_received_total",
        "Inbound broker messages by kind"
    );
    describe_counter!(
        "broker_client_messages_dropped_total",
        "Inbound messages dropped as malformed or inapplicable"
    );
    describe_histogram!(
        "broker_client_dispatch_seconds",
        "Time to apply one inbound message to shared state"
    );

    // Orders
    describe_counter!(
        "broker_client_orders_submitted_total",
        "Orders handed to the transport by order type"
    );
    describe_counter!(
        "broker_client_order_request_failures_total",
        "Order requests that could not be sent, by operation"
    );

    // Session
    describe_gauge!(
        "broker_client_connection_status",
        "0 disconnected, 1 connecting, 2 connected, 3 reconnecting, 4 failed"
    );
    describe_counter!(
        "broker_client_reconnects_total",
        "Explicit reconnect attempts"
    );

    // Strategy
    describe_counter!(
        "broker_client_strategy_faults_total",
        "Strategy runs that ended in an error or panic"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an inbound message.
pub fn record_message_received(kind: &'static str) {
    counter!("broker_client_messages_received_total", "kind" => kind).increment(1);
}

/// Record a dropped inbound message.
pub fn record_message_dropped(reason: &'static str) {
    counter!("broker_client_messages_dropped_total", "reason" => reason).increment(1);
}

/// Record how long one message took to dispatch.
pub fn record_dispatch_duration(duration: Duration) {
    histogram!("broker_client_dispatch_seconds").record(duration.as_secs_f64());
}

/// Record an order handed to the transport.
pub fn record_order_submitted(order_type: &'static str) {
    counter!("broker_client_orders_submitted_total", "order_type" => order_type).increment(1);
}

/// Record an order request that failed to send.
pub fn record_order_failure(operation: &'static str) {
    counter!(
        "broker_client_order_request_failures_total",
        "operation" => operation
    )
    .increment(1);
}

/// Update the connection status gauge.
pub fn set_connection_status(status: ConnectionStatus) {
    gauge!("broker_client_connection_status").set(status.as_gauge());
}

/// Record an explicit reconnect attempt.
pub fn record_reconnect() {
    counter!("broker_client_reconnects_total").increment(1);
}

/// Record a strategy fault.
pub fn record_strategy_fault(kind: &'static str) {
    counter!("broker_client_strategy_faults_total", "kind" => kind).increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_message_received("tick");
        record_message_dropped("malformed");
        record_dispatch_duration(Duration::from_micros(15));
        record_order_submitted("LMT");
        record_order_failure("cancel");
        set_connection_status(ConnectionStatus::Connected);
        record_reconnect();
        record_strategy_fault("panic");
    }
}
