use anyhow::Result;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::config::MetricsConfig;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    // Idempotent: skip if already initialized (safe for tests)
    if !config.enabled || PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(h) => h,
        Err(_) => return Ok(()), // Global recorder already set
    };
    let _ = PROMETHEUS_HANDLE.set(handle);

    metrics::describe_counter!("vaultsync_cache_hits_total", "Requests answered by a fresh entry");
    metrics::describe_counter!("vaultsync_cache_misses_total", "Requests that had to wait for a load");
    metrics::describe_counter!(
        "vaultsync_cache_stale_served_total",
        "Requests answered with a stale value while refreshing"
    );
    metrics::describe_counter!(
        "vaultsync_cache_coalesced_total",
        "Requests joined onto a load already in flight"
    );
    metrics::describe_counter!("vaultsync_loader_calls_total", "Loader invocations");
    metrics::describe_counter!(
        "vaultsync_cache_discarded_total",
        "Load results dropped because a newer load superseded them"
    );
    metrics::describe_counter!("vaultsync_cache_superseded_total", "Loads aborted by a newer load");
    metrics::describe_counter!("vaultsync_cache_fetch_errors_total", "Loads that failed after retries");
    metrics::describe_counter!("vaultsync_router_flushes_total", "Invalidation batches applied");
    metrics::describe_counter!(
        "vaultsync_router_refetches_total",
        "Forced refetches issued by the router"
    );
    metrics::describe_counter!("vaultsync_events_resolved_total", "Logs resolved to cache targets");
    metrics::describe_gauge!("vaultsync_subscriptions_active", "Live log subscriptions");
    metrics::describe_counter!("vaultsync_subscription_drops_total", "Log subscriptions lost");
    metrics::describe_gauge!("vaultsync_chain_head_block", "Latest observed chain head");
    metrics::describe_histogram!(
        "vaultsync_rpc_request_duration_seconds",
        "JSON-RPC request duration in seconds"
    );
    metrics::describe_counter!("vaultsync_rpc_errors_total", "Failed JSON-RPC requests");
    metrics::describe_counter!("vaultsync_actions_total", "Finished actions by outcome");
    metrics::describe_histogram!(
        "vaultsync_action_duration_seconds",
        "Time from invoke to a terminal state"
    );

    Ok(())
}

pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}
