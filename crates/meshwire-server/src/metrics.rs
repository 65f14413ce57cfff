// Prometheus exporter for the metrics recorded by the discovery server

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and describe every meshwire metric
///
/// The returned handle renders the scrape body served at `/metrics`.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    meshwire_xds::metrics::describe_metrics();
    Ok(handle)
}

/// A recorder that is not installed globally, for tests
pub fn local_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}
