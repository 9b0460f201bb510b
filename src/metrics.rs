//! Prometheus metrics

use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::grpc::pool::PoolStats;

/// Setup Prometheus metrics exporter
/// Returns a handle the admin endpoint renders from
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a finished proxied call and its terminal status
pub fn record_call(method: &str, code: tonic::Code, elapsed: Duration) {
    metrics::counter!("grpc_relay_calls_total",
        "method" => method.to_string(),
        "code" => format!("{:?}", code)
    )
    .increment(1);

    metrics::histogram!("grpc_relay_call_duration_seconds",
        "method" => method.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Record an intercepted download lookup whose URL was rewritten
pub fn record_url_rewrite() {
    metrics::counter!("grpc_relay_url_rewrites_total").increment(1);
}

/// Record a failed or timed-out backend dial
pub fn record_dial_failure() {
    metrics::counter!("grpc_relay_pool_dial_failures_total").increment(1);
}

/// Update pool gauges from a stats snapshot
pub fn update_pool_stats(stats: &PoolStats) {
    metrics::gauge!("grpc_relay_pool_connections").set(stats.connections as f64);
    metrics::gauge!("grpc_relay_pool_idle_connections").set(stats.idle_connections as f64);
    metrics::gauge!("grpc_relay_pool_active_streams").set(stats.active_streams as f64);
}
