//! Metrics collection and exposition.
//!
//! # Metrics
//! - `registry_listeners_started_total` (counter)
//! - `registry_listener_failures_total` (counter)
//! - `registry_active_connections` (gauge): authenticated connections
//! - `registry_startup_duration_seconds` (histogram)
//! - `registry_shutdown_total` (counter): by `cause`
//!
//! Recording functions are no-ops until [`init_metrics`] installs the
//! Prometheus recorder, so tests and embedders can call them freely.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_listener_started() {
    counter!("registry_listeners_started_total").increment(1);
}

pub fn record_listener_failure() {
    counter!("registry_listener_failures_total").increment(1);
}

pub fn record_connection_opened() {
    gauge!("registry_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("registry_active_connections").decrement(1.0);
}

pub fn record_startup(elapsed: Duration) {
    histogram!("registry_startup_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_shutdown(cause: &'static str) {
    counter!("registry_shutdown_total", "cause" => cause).increment(1);
}
