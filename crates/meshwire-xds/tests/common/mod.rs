//! Common test utilities for ADS integration testing
//!
//! - `TestServer`: a started discovery server backed by an in-memory store
//! - `AdsTestClient`: a fake proxy driving one ADS stream over channels

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshwire_xds::mesh::{Service, ServicePort, WorkloadEndpoint};
use meshwire_xds::server::no_debounce;
use meshwire_xds::xds::proto::{DiscoveryRequest, DiscoveryResponse, Node, Status as RpcStatus};
use meshwire_xds::{
    ConnectionMeta, DiscoveryServer, DiscoveryServerConfig, GeneratorRegistry, MeshSnapshot,
    MemoryConfigStore, PushRequest, ResourceType, TriggerReason,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

/// How long to wait for a response that should arrive
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait before deciding no response is coming
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub struct TestServer {
    pub server: Arc<DiscoveryServer>,
    pub store: Arc<MemoryConfigStore>,
}

impl TestServer {
    pub fn new(snapshot: MeshSnapshot) -> Self {
        Self::build(snapshot, |_| {}, GeneratorRegistry::with_builtin)
    }

    pub fn with_flow_control(snapshot: MeshSnapshot, enabled: bool) -> Self {
        Self::build(
            snapshot,
            |config| config.flow_control = enabled,
            GeneratorRegistry::with_builtin,
        )
    }

    pub fn build(
        snapshot: MeshSnapshot,
        configure: impl FnOnce(&mut DiscoveryServerConfig),
        generators: impl FnOnce(meshwire_xds::cache::XdsCache) -> GeneratorRegistry,
    ) -> Self {
        let mut config = DiscoveryServerConfig {
            debounce: no_debounce(),
            ..Default::default()
        };
        configure(&mut config);

        let store = Arc::new(MemoryConfigStore::from_snapshot(snapshot));
        let server = DiscoveryServer::with_generators(config, store.clone(), generators);
        store.register_handler(server.config_handler());
        server.start().expect("server starts once");
        Self { server, store }
    }

    /// Open a stream for a sidecar in `namespace`
    pub fn connect(&self, namespace: &str) -> AdsTestClient {
        self.connect_node(&sidecar_id(namespace, &next_ip()))
    }

    pub fn connect_node(&self, node_id: &str) -> AdsTestClient {
        AdsTestClient::connect(self.server.clone(), node_id)
    }

    /// Full push to every connected proxy
    pub fn push_all(&self) {
        self.server.push(PushRequest::full(TriggerReason::DebugTrigger));
    }

    /// Wait until the registry holds `count` connections
    pub async fn wait_for_connections(&self, count: usize) {
        let server = self.server.clone();
        tokio::time::timeout(RESPONSE_TIMEOUT, async move {
            while server.registry().len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {} connections, have {}",
                count,
                self.server.registry().len()
            )
        });
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn next_ip() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(1);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff)
}

pub fn sidecar_id(namespace: &str, ip: &str) -> String {
    format!("sidecar~{}~app.{}~{}.svc.cluster.local", ip, namespace, namespace)
}

/// Fake proxy on one ADS stream
pub struct AdsTestClient {
    node: Node,
    type_url: String,
    node_sent: bool,
    requests: Option<mpsc::Sender<Result<DiscoveryRequest, Status>>>,
    responses: mpsc::Receiver<Result<DiscoveryResponse, Status>>,
    task: JoinHandle<meshwire_xds::Result<()>>,
}

impl AdsTestClient {
    fn connect(server: Arc<DiscoveryServer>, node_id: &str) -> Self {
        let (req_tx, req_rx) = mpsc::channel(16);
        let (resp_tx, resp_rx) = mpsc::channel(16);
        let meta = ConnectionMeta {
            peer_addr: "127.0.0.1:15000".to_string(),
            identities: vec![],
        };
        let errors = resp_tx.clone();
        let task = tokio::spawn(async move {
            let result = server.stream(meta, ReceiverStream::new(req_rx), resp_tx).await;
            if let Err(e) = &result {
                let _ = errors.send(Err(Status::internal(e.to_string()))).await;
            }
            result
        });

        Self {
            node: Node {
                id: node_id.to_string(),
                cluster: "test-cluster".to_string(),
                ..Default::default()
            },
            type_url: ResourceType::Cluster.type_url().to_string(),
            node_sent: false,
            requests: Some(req_tx),
            responses: resp_rx,
            task,
        }
    }

    pub fn with_type(mut self, resource_type: ResourceType) -> Self {
        self.type_url = resource_type.type_url().to_string();
        self
    }

    /// Never attach the node, as a misbehaving proxy would
    pub fn without_node(mut self) -> Self {
        self.node_sent = true;
        self
    }

    /// Send a request, filling in the type and, on the first request, the node
    pub async fn send(&mut self, mut request: DiscoveryRequest) {
        if request.type_url.is_empty() {
            request.type_url = self.type_url.clone();
        }
        if !self.node_sent {
            request.node = Some(self.node.clone());
            self.node_sent = true;
        }
        self.requests
            .as_ref()
            .expect("stream still open")
            .send(Ok(request))
            .await
            .expect("server reads requests");
    }

    pub async fn request(&mut self, names: &[&str], nonce: &str, version: &str) {
        self.send(DiscoveryRequest {
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            response_nonce: nonce.to_string(),
            version_info: version.to_string(),
            ..Default::default()
        })
        .await;
    }

    pub async fn ack(&mut self, response: &DiscoveryResponse, names: &[&str]) {
        self.request(names, &response.nonce, &response.version_info).await;
    }

    pub async fn nack(&mut self, response: &DiscoveryResponse, message: &str) {
        self.send(DiscoveryRequest {
            response_nonce: response.nonce.clone(),
            version_info: response.version_info.clone(),
            error_detail: Some(RpcStatus {
                code: 3,
                message: message.to_string(),
            }),
            ..Default::default()
        })
        .await;
    }

    /// Request `names`, wait for the response and ACK it
    pub async fn request_response_ack(&mut self, names: &[&str]) -> DiscoveryResponse {
        self.request(names, "", "").await;
        let response = self.expect_response().await;
        self.ack(&response, names).await;
        response
    }

    pub async fn expect_response(&mut self) -> DiscoveryResponse {
        match tokio::time::timeout(RESPONSE_TIMEOUT, self.responses.recv()).await {
            Ok(Some(Ok(response))) => response,
            Ok(Some(Err(status))) => panic!("stream failed: {}", status),
            Ok(None) => panic!("stream closed while waiting for a response"),
            Err(_) => panic!("no response within {:?}", RESPONSE_TIMEOUT),
        }
    }

    /// Next response if one arrives within the quiet period
    pub async fn try_response(&mut self) -> Option<DiscoveryResponse> {
        match tokio::time::timeout(QUIET_PERIOD, self.responses.recv()).await {
            Ok(Some(Ok(response))) => Some(response),
            Ok(Some(Err(status))) => panic!("stream failed: {}", status),
            Ok(None) | Err(_) => None,
        }
    }

    pub async fn expect_no_response(&mut self) {
        if let Ok(Some(message)) = tokio::time::timeout(QUIET_PERIOD, self.responses.recv()).await
        {
            panic!("unexpected response: {:?}", message);
        }
    }

    pub async fn expect_error(&mut self) -> Status {
        match tokio::time::timeout(RESPONSE_TIMEOUT, self.responses.recv()).await {
            Ok(Some(Err(status))) => status,
            Ok(Some(Ok(response))) => panic!("expected an error, got {:?}", response),
            Ok(None) => panic!("stream closed without an error"),
            Err(_) => panic!("no error within {:?}", RESPONSE_TIMEOUT),
        }
    }

    /// Wait for the server to end the stream
    pub async fn expect_closed(mut self) -> meshwire_xds::Result<()> {
        self.requests.take();
        tokio::time::timeout(RESPONSE_TIMEOUT, &mut self.task)
            .await
            .expect("stream task ends")
            .expect("stream task does not panic")
    }

    /// Close the stream from the proxy side
    pub async fn close(mut self) {
        self.requests.take();
        let _ = tokio::time::timeout(RESPONSE_TIMEOUT, &mut self.task).await;
    }

    /// Wait until the server ends the stream on its own
    pub async fn wait_server_close(&mut self) -> meshwire_xds::Result<()> {
        tokio::time::timeout(RESPONSE_TIMEOUT, &mut self.task)
            .await
            .expect("server closes the stream")
            .expect("stream task does not panic")
    }
}

pub fn http_service(hostname: &str, namespace: &str, port: u32) -> Service {
    Service {
        hostname: hostname.to_string(),
        namespace: namespace.to_string(),
        ports: vec![ServicePort {
            name: "http".to_string(),
            port,
            protocol: "HTTP".to_string(),
        }],
    }
}

pub fn endpoint(address: &str, port: u32) -> WorkloadEndpoint {
    WorkloadEndpoint {
        address: address.to_string(),
        port,
        locality: None,
        weight: 1,
        labels: Default::default(),
    }
}

/// Names of the resources in a response, decoded from their JSON bodies
pub fn resource_names(response: &DiscoveryResponse) -> Vec<String> {
    let mut names: Vec<String> = response
        .resources
        .iter()
        .map(|any| {
            let body: serde_json::Value =
                serde_json::from_slice(&any.value).expect("resource body is JSON");
            body.get("name")
                .or_else(|| body.get("cluster_name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    names.sort();
    names
}
