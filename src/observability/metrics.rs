//! Prometheus exposition of proxy counters.
//!
//! # Metrics
//! - `proxy_client_connections_total`: accepted client sockets
//! - `proxy_requests_total`: requests read from clients
//! - `proxy_synthesized_responses_total{status}`: responses the proxy
//!   answered itself (auth challenges, gateway errors, filter denials)
//! - `proxy_server_connections_total`: successful server-leg dials
//! - `proxy_dial_failures_total`: failed dial attempts, one per hop tried
//! - `proxy_active_client_connections` (gauge): client sockets currently open

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the global recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn describe_metrics() {
    describe_counter!("proxy_client_connections_total", "Client connections accepted");
    describe_counter!("proxy_requests_total", "Requests received from clients");
    describe_counter!(
        "proxy_synthesized_responses_total",
        "Responses generated by the proxy instead of an upstream"
    );
    describe_counter!("proxy_server_connections_total", "Upstream connections established");
    describe_counter!("proxy_dial_failures_total", "Upstream dial attempts that failed");
    describe_gauge!("proxy_active_client_connections", "Client connections currently open");
}
