//! Main entry point for the Meshwire xDS control plane.

use std::net::SocketAddr;

use anyhow::Context;
use meshwire_server::{
    config::Configuration,
    debug::DebugState,
    logging, metrics,
    shutdown::{ShutdownSignal, listen_for_os_signals},
    startup,
};
use tracing::{error, info};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;

    let _logging_guard = logging::init_logging(&configuration.logging_config())?;

    let prometheus = match metrics::init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Metrics disabled: {:#}", e);
            None
        }
    };

    let discovery_config = configuration.to_discovery_config();
    info!(
        server_id = %discovery_config.server_id,
        flow_control = discovery_config.flow_control,
        push_concurrency = discovery_config.push_concurrency,
        debounce = discovery_config.debounce.enabled,
        "Starting Meshwire"
    );

    let snapshot = startup::load_mesh(&configuration.mesh_file())?;
    let (server, _store) = startup::start_discovery(discovery_config, snapshot)?;

    let shutdown = ShutdownSignal::new();
    listen_for_os_signals(shutdown.clone());

    let xds_address: SocketAddr = format!(
        "{}:{}",
        configuration.xds_address(),
        configuration.xds_port()
    )
    .parse()
    .context("invalid xDS listen address")?;
    let xds_task = tokio::spawn(startup::serve_xds(
        server.clone(),
        xds_address,
        shutdown.clone(),
    ));

    let debug_port = configuration.debug_port();
    let debug_server = startup::debug_server(
        DebugState {
            server: server.clone(),
            prometheus,
            unsafe_endpoints: configuration.debug_unsafe_endpoints(),
            trusted_proxies: configuration.debug_trusted_proxies()?.into(),
        },
        configuration.xds_address(),
        debug_port,
    )
    .with_context(|| format!("failed to bind debug server on port {}", debug_port))?;
    let debug_handle = debug_server.handle();
    info!(port = debug_port, "Debug server listening");

    let debug_task = actix_web::rt::spawn(debug_server);

    tokio::select! {
        _ = shutdown.wait() => {}
        result = xds_task => {
            match result {
                Ok(Err(e)) => error!("xDS server stopped: {:#}", e),
                Err(e) => error!("xDS server task failed: {}", e),
                Ok(Ok(())) => {}
            }
            shutdown.shutdown();
        }
    }

    info!("Shutting down");
    server.shutdown();
    debug_handle.stop(true).await;
    if let Err(e) = debug_task.await {
        error!("Debug server task failed: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}
