use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "collector_cycles_total",
        "Collection cycles by status (completed, skipped, failed)."
    );
    describe_histogram!(
        "collector_cycle_duration_ms",
        "Wall time of one collection cycle in milliseconds."
    );
    describe_counter!(
        "collector_snapshots_stored_total",
        "Balance snapshots written by collection cycles."
    );
    describe_counter!(
        "collector_fetch_failures_total",
        "Failed live balance reads by network and error kind."
    );
    describe_counter!(
        "collector_fallback_substitutions_total",
        "Balances substituted after a failed live read, by source."
    );
    describe_histogram!(
        "collector_rpc_latency_ms",
        "JSON-RPC request latency in milliseconds."
    );
    describe_histogram!(
        "collector_db_query_latency_ms",
        "SQLite operation latency in milliseconds."
    );
    describe_counter!(
        "collector_db_query_errors_total",
        "Failed SQLite operations."
    );
    describe_counter!(
        "collector_tracing_error_events",
        "ERROR-level log events."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}
