//! Server wiring: mesh seed, ADS gRPC listener and the debug HTTP server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware::Logger, web};
use anyhow::Context;
use meshwire_xds::{
    AdsService, AggregatedDiscoveryServiceServer, DiscoveryServer, DiscoveryServerConfig,
    MemoryConfigStore, MeshSnapshot,
};
use tracing::{info, warn};

use crate::debug::{self, DebugState};
use crate::shutdown::ShutdownSignal;

/// Read the mesh seed file; a missing file starts an empty mesh
pub fn load_mesh(path: &Path) -> anyhow::Result<MeshSnapshot> {
    if !path.exists() {
        warn!(path = %path.display(), "Mesh file not found, starting with an empty mesh");
        return Ok(MeshSnapshot::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read mesh file {}", path.display()))?;
    let snapshot = MeshSnapshot::from_yaml(&contents)
        .with_context(|| format!("invalid mesh file {}", path.display()))?;
    info!(
        path = %path.display(),
        services = snapshot.services.len(),
        virtual_services = snapshot.virtual_services.len(),
        destination_rules = snapshot.destination_rules.len(),
        sidecars = snapshot.sidecars.len(),
        "Loaded mesh configuration"
    );
    Ok(snapshot)
}

/// Discovery server seeded from `snapshot`, subscribed to the store and started
pub fn start_discovery(
    config: DiscoveryServerConfig,
    snapshot: MeshSnapshot,
) -> anyhow::Result<(Arc<DiscoveryServer>, Arc<MemoryConfigStore>)> {
    let store = Arc::new(MemoryConfigStore::from_snapshot(snapshot));
    let server = DiscoveryServer::new(config, store.clone());
    store.register_handler(server.config_handler());
    server.start().context("failed to start discovery server")?;
    Ok((server, store))
}

/// Serve ADS until `shutdown` fires
pub async fn serve_xds(
    server: Arc<DiscoveryServer>,
    address: SocketAddr,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    info!(%address, "Starting xDS gRPC server");
    tonic::transport::Server::builder()
        .add_service(AggregatedDiscoveryServiceServer::new(AdsService::new(
            server,
        )))
        .serve_with_shutdown(address, shutdown.wait())
        .await
        .with_context(|| format!("xDS server on {} failed", address))
}

/// Creates and binds the debug HTTP server.
pub fn debug_server(state: DebugState, address: String, port: u16) -> std::io::Result<Server> {
    Ok(HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(|cfg| debug::configure(cfg, &state))
    })
    .workers(2)
    .disable_signals()
    .bind((address, port))?
    .run())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use meshwire_xds::ConfigSource;

    use super::*;

    #[test]
    fn test_missing_mesh_file_is_empty() {
        let snapshot = load_mesh(Path::new("/nonexistent/mesh.yml")).unwrap();
        assert!(snapshot.services.is_empty());
    }

    #[test]
    fn test_invalid_mesh_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"services: [not, a, service]\n").unwrap();
        assert!(load_mesh(file.path()).is_err());
    }

    #[test]
    fn test_load_mesh_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
services:
  - hostname: reviews.bookinfo.svc.cluster.local
    namespace: bookinfo
    ports:
      - name: http
        port: 9080
        protocol: HTTP
"#,
        )
        .unwrap();
        let snapshot = load_mesh(file.path()).unwrap();
        assert_eq!(snapshot.services.len(), 1);
        assert_eq!(snapshot.services[0].namespace, "bookinfo");
    }

    #[test]
    fn test_bundled_mesh_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../conf/mesh.yml");
        let snapshot = load_mesh(&path).unwrap();
        assert_eq!(snapshot.services.len(), 4);
        assert_eq!(snapshot.virtual_services.len(), 2);
        assert_eq!(snapshot.endpoints["reviews.bookinfo.svc.cluster.local"].len(), 2);
    }

    #[tokio::test]
    async fn test_start_discovery_then_shutdown() {
        let (server, store) =
            start_discovery(DiscoveryServerConfig::default(), MeshSnapshot::default()).unwrap();
        assert!(!server.is_shutdown());
        assert!(store.snapshot().services.is_empty());
        server.shutdown();
        assert!(server.is_shutdown());
    }
}
