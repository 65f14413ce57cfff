//! Debug HTTP surface served on the monitoring port
//!
//! Every `/debug/*` route sits behind [`guard::LocalOrAuthenticated`];
//! `/metrics` is open so scrapers need no identity.

use std::net::IpAddr;
use std::sync::Arc;

use actix_web::web;
use meshwire_xds::DiscoveryServer;
use metrics_exporter_prometheus::PrometheusHandle;

pub mod guard;
mod handlers;

/// Shared state for the debug handlers
#[derive(Clone)]
pub struct DebugState {
    pub server: Arc<DiscoveryServer>,
    pub prometheus: Option<PrometheusHandle>,
    pub unsafe_endpoints: bool,
    /// Fronting proxies allowed to vouch for a caller with the identity header
    pub trusted_proxies: Arc<[IpAddr]>,
}

/// Path and help text of every registered debug command
const ENDPOINTS: &[(&str, &str)] = &[
    ("/debug/adsz", "Status and debug interface for ADS"),
    (
        "/debug/adsz?push=true",
        "Initiates push of the current state to all connected endpoints",
    ),
    ("/debug/cachez", "Info about the internal XDS caches"),
    (
        "/debug/config_distribution",
        "Version status of all proxies connected to this instance",
    ),
    ("/debug/configz", "Debug support for config"),
    ("/debug/connections", "Info about the connected XDS clients"),
    ("/debug/edsz", "Status and debug interface for EDS"),
    ("/debug/list", "List all supported debug commands in json"),
    ("/debug/push_status", "Last push details"),
    ("/debug/resourcesz", "Debug support for watched resources"),
    ("/debug/sidecarz", "Debug sidecar scope for a proxy"),
    (
        "/debug/syncz",
        "Synchronization status of all proxies connected to this instance",
    ),
];

const FORCE_DISCONNECT: (&str, &str) = (
    "/debug/force_disconnect",
    "Disconnects a proxy from this instance",
);

/// Registered commands, sorted by path
pub fn endpoints(unsafe_endpoints: bool) -> Vec<(&'static str, &'static str)> {
    let mut all = ENDPOINTS.to_vec();
    if unsafe_endpoints {
        all.push(FORCE_DISCONNECT);
    }
    all.sort();
    all
}

/// Mount the debug scope and the metrics route
pub fn configure(cfg: &mut web::ServiceConfig, state: &DebugState) {
    let mut scope = web::scope("/debug")
        .wrap(guard::LocalOrAuthenticated::new(state.trusted_proxies.clone()))
        .route("", web::get().to(handlers::index))
        .route("/list", web::get().to(handlers::list))
        .route("/adsz", web::get().to(handlers::adsz))
        .route("/connections", web::get().to(handlers::connections))
        .route("/syncz", web::get().to(handlers::syncz))
        .route(
            "/config_distribution",
            web::get().to(handlers::config_distribution),
        )
        .route("/cachez", web::get().to(handlers::cachez))
        .route("/resourcesz", web::get().to(handlers::resourcesz))
        .route("/sidecarz", web::get().to(handlers::sidecarz))
        .route("/edsz", web::get().to(handlers::edsz))
        .route("/configz", web::get().to(handlers::configz))
        .route("/push_status", web::get().to(handlers::push_status));

    if state.unsafe_endpoints {
        scope = scope
            .route("/force_disconnect", web::get().to(handlers::force_disconnect))
            .route("/force_disconnect", web::post().to(handlers::force_disconnect));
    }

    cfg.service(scope)
        .route("/metrics", web::get().to(handlers::metrics));
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use actix_web::{App, http::StatusCode, test};
    use meshwire_xds::server::no_debounce;
    use meshwire_xds::xds::proto::Node;
    use meshwire_xds::{
        Connection, ConnectionMeta, DiscoveryServerConfig, MemoryConfigStore, Proxy,
    };
    use tokio::sync::mpsc;

    use super::*;

    const LOCAL: &str = "127.0.0.1:5000";
    const REMOTE: &str = "10.1.2.3:5000";
    const TRUSTED: &str = "10.1.0.1:5000";
    const PROXY: &str = "sidecar~10.0.0.9~reviews-v1.bookinfo~bookinfo.svc.cluster.local";

    fn state(unsafe_endpoints: bool) -> DebugState {
        let server = DiscoveryServer::new(
            DiscoveryServerConfig {
                debounce: no_debounce(),
                ..Default::default()
            },
            Arc::new(MemoryConfigStore::new()),
        );
        DebugState {
            server,
            prometheus: Some(crate::metrics::local_handle()),
            unsafe_endpoints,
            trusted_proxies: Arc::from([TRUSTED.parse::<SocketAddr>().unwrap().ip()]),
        }
    }

    fn connect(state: &DebugState, node_id: &str) -> Arc<Connection> {
        let registry = state.server.registry();
        let proxy = Proxy::from_node(
            &Node {
                id: node_id.to_string(),
                ..Default::default()
            },
            "default",
        )
        .unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let (con, _channels) = Connection::new(
            registry.next_connection_id(&proxy.id),
            ConnectionMeta {
                peer_addr: "10.0.0.9:40000".to_string(),
                identities: vec![],
            },
            proxy,
            tx,
        );
        registry.register(con.clone());
        con
    }

    macro_rules! app {
        ($state:expr) => {{
            let state = $state.clone();
            test::init_service(
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .configure(|cfg| configure(cfg, &state)),
            )
            .await
        }};
    }

    fn get(uri: &str) -> test::TestRequest {
        test::TestRequest::get()
            .uri(uri)
            .peer_addr(LOCAL.parse::<SocketAddr>().unwrap())
    }

    fn remote(uri: &str, peer: &str, identity: Option<&str>) -> test::TestRequest {
        let mut req = test::TestRequest::get()
            .uri(uri)
            .peer_addr(peer.parse::<SocketAddr>().unwrap());
        if let Some(identity) = identity {
            req = req.insert_header((meshwire_xds::grpc::IDENTITY_HEADER, identity));
        }
        req
    }

    const ADMIN: &str = "spiffe://cluster.local/ns/mesh-system/sa/admin";

    #[actix_web::test]
    async fn test_remote_caller_without_identity_is_rejected() {
        let state = state(false);
        let app = app!(state);

        let resp = test::call_service(&app, remote("/debug/syncz", REMOTE, None).to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = test::call_service(&app, remote("/debug/syncz", TRUSTED, None).to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_identity_header_only_from_trusted_proxy() {
        let state = state(false);
        connect(&state, PROXY);
        let app = app!(state);

        let resp = test::call_service(&app, remote("/debug/syncz", TRUSTED, Some(ADMIN)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        // a caller cannot vouch for itself
        for uri in ["/debug/syncz", "/debug/adsz?push=true"] {
            let resp = test::call_service(&app, remote(uri, REMOTE, Some(ADMIN)).to_request()).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }
        assert_eq!(state.server.push_context().counter(), 1);
    }

    #[actix_web::test]
    async fn test_metrics_is_open_to_remote_callers() {
        let state = state(false);
        let app = app!(state);
        let req = test::TestRequest::get()
            .uri("/metrics")
            .peer_addr(REMOTE.parse::<SocketAddr>().unwrap())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_list_is_sorted_and_excludes_itself() {
        let state = state(false);
        let app = app!(state);
        let names: Vec<String> =
            test::call_and_read_body_json(&app, get("/debug/list").to_request()).await;

        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(!names.contains(&"list".to_string()));
        assert!(names.contains(&"adsz".to_string()));
        assert!(names.contains(&"adsz?push=true".to_string()));
        assert!(!names.contains(&"force_disconnect".to_string()));
    }

    #[actix_web::test]
    async fn test_index_lists_commands() {
        let state = state(true);
        let app = app!(state);
        let resp = test::call_service(&app, get("/debug").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("/debug/syncz"));
        assert!(body.contains("/debug/force_disconnect"));
    }

    #[actix_web::test]
    async fn test_adsz_shape() {
        let state = state(false);
        connect(&state, PROXY);
        let app = app!(state);

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, get("/debug/adsz").to_request()).await;
        assert_eq!(body["totalClients"], 1);
        let client = &body["clients"][0];
        assert!(client["connectionId"].as_str().unwrap().contains("10.0.0.9"));
        assert_eq!(client["address"], "10.0.0.9:40000");
    }

    #[actix_web::test]
    async fn test_adsz_push() {
        let state = state(false);
        connect(&state, PROXY);
        connect(&state, "sidecar~10.0.0.10~ratings-v1.bookinfo~bookinfo.svc.cluster.local");
        let app = app!(state);

        let resp = test::call_service(&app, get("/debug/adsz?push=true").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert_eq!(body, "Pushed to 2 servers\n");
    }

    #[actix_web::test]
    async fn test_proxy_id_required() {
        let state = state(false);
        let app = app!(state);
        for uri in ["/debug/sidecarz", "/debug/edsz", "/debug/sidecarz?proxyID="] {
            let resp = test::call_service(&app, get(uri).to_request()).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
            let body = test::read_body(resp).await;
            assert_eq!(body, MISSING_PROXY_ID_BODY);
        }
    }

    const MISSING_PROXY_ID_BODY: &str = "You must provide a proxyID in the query string\n";

    #[actix_web::test]
    async fn test_unknown_proxy_is_not_found() {
        let state = state(false);
        connect(&state, PROXY);
        let app = app!(state);
        let resp =
            test::call_service(&app, get("/debug/sidecarz?proxyID=10.9.9.9").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_sidecarz_for_connected_proxy() {
        let state = state(false);
        connect(&state, PROXY);
        let app = app!(state);
        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            get("/debug/sidecarz?proxyID=10.0.0.9").to_request(),
        )
        .await;
        assert_eq!(body["namespace"], "bookinfo");
    }

    #[actix_web::test]
    async fn test_config_distribution_requires_resource() {
        let state = state(false);
        connect(&state, PROXY);
        let app = app!(state);

        let resp =
            test::call_service(&app, get("/debug/config_distribution").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            get("/debug/config_distribution?resource=VirtualService/bookinfo/reviews&proxy_namespace=bookinfo")
                .to_request(),
        )
        .await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            get("/debug/config_distribution?resource=VirtualService/bookinfo/reviews&proxy_namespace=other")
                .to_request(),
        )
        .await;
        assert_eq!(body.as_array().map(Vec::len), Some(0));
    }

    #[actix_web::test]
    async fn test_force_disconnect_only_when_enabled() {
        let state_off = state(false);
        connect(&state_off, PROXY);
        let app = app!(state_off);
        let resp = test::call_service(
            &app,
            get("/debug/force_disconnect?proxyID=10.0.0.9").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let state_on = state(true);
        let con = connect(&state_on, PROXY);
        let app = app!(state_on);
        let resp = test::call_service(
            &app,
            get("/debug/force_disconnect?proxyID=10.0.0.9").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(test::read_body(resp).await, "OK");
        assert!(con.is_stopped());
    }

    #[actix_web::test]
    async fn test_read_only_views() {
        let state = state(false);
        connect(&state, PROXY);
        let app = app!(state);

        for uri in [
            "/debug/connections",
            "/debug/syncz",
            "/debug/cachez",
            "/debug/resourcesz",
            "/debug/configz",
            "/debug/push_status",
            "/debug/edsz?proxyID=10.0.0.9",
        ] {
            let resp = test::call_service(&app, get(uri).to_request()).await;
            assert_eq!(resp.status(), StatusCode::OK, "{}", uri);
        }

        let syncz: serde_json::Value =
            test::call_and_read_body_json(&app, get("/debug/syncz").to_request()).await;
        assert!(syncz[0]["proxy"].as_str().unwrap().contains("10.0.0.9"));
    }
}
