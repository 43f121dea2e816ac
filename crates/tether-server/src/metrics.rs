//! Metrics collection and export for Tether.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tether_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
    pub const CLIENTS_ONLINE: &str = "tether_clients_online";
    pub const FRAMES_TOTAL: &str = "tether_frames_total";
    pub const NOTIFY_TOTAL: &str = "tether_notify_total";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Start the Prometheus metrics server.
///
/// Installs the global recorder, then registers metric descriptions with it.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Register metric descriptions with the installed recorder.
fn describe_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of transport connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open transport connections"
    );
    metrics::describe_gauge!(
        names::CLIENTS_ONLINE,
        "Current number of registered clients"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Inbound frames by outcome");
    metrics::describe_counter!(names::NOTIFY_TOTAL, "Notify requests by delivery status");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an inbound frame by outcome label.
pub fn record_frame(outcome: &'static str) {
    counter!(names::FRAMES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a notify request by delivery status.
pub fn record_notify(status: &'static str) {
    counter!(names::NOTIFY_TOTAL, "status" => status).increment(1);
}

/// Update the registered client gauge.
pub fn set_clients_online(count: usize) {
    gauge!(names::CLIENTS_ONLINE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
