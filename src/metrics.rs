//! Metrics initialization for the Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::Result;

/// Queries seen by the proxy, labelled by `verdict` (`allowed` or `blocked`).
pub const QUERIES: &str = "dnsveil_queries_total";
/// Packets dropped without reply, labelled by `reason`.
pub const DROPPED_PACKETS: &str = "dnsveil_dropped_packets_total";
/// Pending upstream requests closed before their reply arrived.
pub const PENDING_EVICTIONS: &str = "dnsveil_pending_evictions_total";
/// Reconnect attempts made by the supervisor.
pub const RECONNECTS: &str = "dnsveil_reconnects_total";

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape. Otherwise every counter
/// recorded by the tunnel is a no-op.
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| crate::error::Error::Metrics(err.to_string()))?;

    metrics::describe_counter!(QUERIES, "DNS queries handled by the tunnel");
    metrics::describe_counter!(DROPPED_PACKETS, "Packets dropped without a reply");
    metrics::describe_counter!(PENDING_EVICTIONS, "Upstream requests evicted before replying");
    metrics::describe_counter!(RECONNECTS, "Tunnel reconnect attempts");

    Ok(())
}
