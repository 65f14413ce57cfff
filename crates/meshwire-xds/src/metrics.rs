// Metrics for the push engine
// Recorded through the `metrics` facade; a no-op until the process installs a recorder

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::xds::ResourceType;

/// Register metric descriptions. Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!("meshwire_xds_pushes_total", "Responses sent to proxies");
    describe_counter!(
        "meshwire_xds_push_errors_total",
        "Pushes that failed to generate or send"
    );
    describe_counter!("meshwire_xds_rejects_total", "NACKs received from proxies");
    describe_counter!(
        "meshwire_xds_expired_nonce_total",
        "Requests carrying a nonce other than the last one sent"
    );
    describe_counter!(
        "meshwire_xds_delayed_pushes_total",
        "Pushes held back until an outstanding response was answered"
    );
    describe_counter!(
        "meshwire_xds_pruned_pushes_total",
        "Connections skipped because a change was outside their scope"
    );
    describe_counter!(
        "meshwire_xds_config_updates_total",
        "Config change events received"
    );
    describe_gauge!("meshwire_xds_connected_clients", "Connected ADS streams");
    describe_gauge!(
        "meshwire_xds_push_queue_size",
        "Connections waiting in the push queue"
    );
    describe_histogram!(
        "meshwire_xds_push_time_seconds",
        "Time to generate and send one response"
    );
    describe_histogram!("meshwire_xds_response_bytes", "Size of generated responses");
    describe_histogram!(
        "meshwire_xds_proxy_convergence_seconds",
        "Time from a config change to the response that carries it"
    );
    tracing::info!("xDS metrics described");
}

pub fn record_push(t: ResourceType, elapsed: Duration, bytes: usize) {
    counter!("meshwire_xds_pushes_total", "type" => t.short_name()).increment(1);
    histogram!("meshwire_xds_push_time_seconds", "type" => t.short_name())
        .record(elapsed.as_secs_f64());
    histogram!("meshwire_xds_response_bytes", "type" => t.short_name()).record(bytes as f64);
}

pub fn record_push_error(t: ResourceType, reason: &'static str) {
    counter!("meshwire_xds_push_errors_total", "type" => t.short_name(), "reason" => reason)
        .increment(1);
}

pub fn record_reject(t: ResourceType) {
    counter!("meshwire_xds_rejects_total", "type" => t.short_name()).increment(1);
}

pub fn record_expired_nonce(t: ResourceType) {
    counter!("meshwire_xds_expired_nonce_total", "type" => t.short_name()).increment(1);
}

pub fn record_delayed_push(t: ResourceType) {
    counter!("meshwire_xds_delayed_pushes_total", "type" => t.short_name()).increment(1);
}

pub fn record_pruned(count: usize) {
    counter!("meshwire_xds_pruned_pushes_total").increment(count as u64);
}

pub fn record_config_update(full: bool) {
    counter!("meshwire_xds_config_updates_total", "full" => if full { "true" } else { "false" })
        .increment(1);
}

pub fn set_connected_clients(count: usize) {
    gauge!("meshwire_xds_connected_clients").set(count as f64);
}

pub fn set_queue_size(count: usize) {
    gauge!("meshwire_xds_push_queue_size").set(count as f64);
}

pub fn record_convergence(elapsed: Duration) {
    histogram!("meshwire_xds_proxy_convergence_seconds").record(elapsed.as_secs_f64());
}
