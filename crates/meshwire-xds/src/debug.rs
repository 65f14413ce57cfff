//! Read-only views over the discovery server, plus the two administrative
//! actions (force push, force disconnect).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::connection::Connection;
use crate::context::PushContextSummary;
use crate::error::{Result, XdsError};
use crate::generators::EndpointGenerator;
use crate::mesh::MeshSnapshot;
use crate::model::{PushRequest, TriggerReason};
use crate::scope::SidecarScope;
use crate::server::DiscoveryServer;
use crate::watch::WatchedResource;
use crate::xds::ResourceType;
use crate::xds::resources::{ClusterLoadAssignment, cluster_name};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdsClient {
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub address: String,
    /// Watched resource names keyed by type URL
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub watches: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdsClients {
    pub total_clients: usize,
    pub clients: Vec<AdsClient>,
}

/// Sent and acknowledged nonces per type for one proxy
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub proxy: String,
    pub cluster_sent: String,
    pub cluster_acked: String,
    pub cluster_nacked: String,
    pub listener_sent: String,
    pub listener_acked: String,
    pub listener_nacked: String,
    pub route_sent: String,
    pub route_acked: String,
    pub route_nacked: String,
    pub endpoint_sent: String,
    pub endpoint_acked: String,
    pub endpoint_nacked: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncStatus {
    fn record(&mut self, w: &WatchedResource) {
        let (sent, acked, nacked) = match w.resource_type {
            ResourceType::Cluster => (
                &mut self.cluster_sent,
                &mut self.cluster_acked,
                &mut self.cluster_nacked,
            ),
            ResourceType::Listener => (
                &mut self.listener_sent,
                &mut self.listener_acked,
                &mut self.listener_nacked,
            ),
            ResourceType::Route => (
                &mut self.route_sent,
                &mut self.route_acked,
                &mut self.route_nacked,
            ),
            ResourceType::Endpoint => (
                &mut self.endpoint_sent,
                &mut self.endpoint_acked,
                &mut self.endpoint_nacked,
            ),
        };
        *sent = w.nonce_sent.clone();
        *acked = w.nonce_acked.clone();
        *nacked = w.nonce_nacked.clone();
        if w.last_error.is_some() {
            self.last_error = w.last_error.clone();
        }
    }
}

/// Revision of one config as applied by a proxy, per resource type
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncedVersions {
    pub proxy: String,
    pub cluster_acked: Option<u64>,
    pub listener_acked: Option<u64>,
    pub route_acked: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyResources {
    pub proxy: String,
    pub connection_id: String,
    pub watches: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigDump {
    pub push_context: PushContextSummary,
    pub config: MeshSnapshot,
}

fn watched_names(con: &Connection) -> BTreeMap<String, Vec<String>> {
    con.watches_snapshot()
        .into_iter()
        .map(|w| (w.resource_type.type_url().to_string(), w.resource_names))
        .collect()
}

fn client(con: &Connection, with_watches: bool) -> AdsClient {
    AdsClient {
        connection_id: con.con_id().to_string(),
        connected_at: con.connected_at(),
        address: con.peer_addr().to_string(),
        watches: if with_watches {
            watched_names(con)
        } else {
            BTreeMap::new()
        },
    }
}

impl DiscoveryServer {
    /// Connected clients with their watches (adsz)
    pub fn ads_clients(&self) -> AdsClients {
        let clients: Vec<AdsClient> = self
            .registry
            .list()
            .iter()
            .map(|con| client(con, true))
            .collect();
        AdsClients {
            total_clients: clients.len(),
            clients,
        }
    }

    pub fn connections(&self) -> Vec<AdsClient> {
        self.registry
            .list()
            .iter()
            .map(|con| client(con, false))
            .collect()
    }

    pub fn sync_status(&self) -> Vec<SyncStatus> {
        self.registry
            .list()
            .iter()
            .map(|con| {
                let mut status = SyncStatus {
                    proxy: con.con_id().to_string(),
                    ..Default::default()
                };
                for w in con.watches_snapshot() {
                    status.record(&w);
                }
                status
            })
            .collect()
    }

    /// Which revision of `resource` (a config key such as
    /// `VirtualService/default/reviews`) each proxy has acknowledged
    pub fn distributed_versions(
        &self,
        resource: &str,
        proxy_namespace: Option<&str>,
    ) -> Vec<SyncedVersions> {
        self.registry
            .list()
            .iter()
            .filter(|con| proxy_namespace.is_none_or(|ns| con.proxy().namespace == ns))
            .map(|con| {
                let acked = |t: ResourceType| {
                    con.watched(t)
                        .and_then(|w| self.ledger.previous_value(&w.nonce_acked, resource))
                };
                SyncedVersions {
                    proxy: con.con_id().to_string(),
                    cluster_acked: acked(ResourceType::Cluster),
                    listener_acked: acked(ResourceType::Listener),
                    route_acked: acked(ResourceType::Route),
                }
            })
            .collect()
    }

    pub fn cache_keys(&self) -> Vec<String> {
        self.cache.keys()
    }

    pub fn resources(&self) -> Vec<ProxyResources> {
        self.registry
            .list()
            .iter()
            .map(|con| ProxyResources {
                proxy: con.proxy_id(),
                connection_id: con.con_id().to_string(),
                watches: watched_names(con),
            })
            .collect()
    }

    /// First connection whose id contains `proxy_id`
    pub fn find_connection(&self, proxy_id: &str) -> Option<Arc<Connection>> {
        self.registry.find(|con| con.con_id().contains(proxy_id))
    }

    fn require_connection(&self, proxy_id: &str) -> Result<Arc<Connection>> {
        self.find_connection(proxy_id)
            .ok_or_else(|| XdsError::ConnectionNotFound(proxy_id.to_string()))
    }

    pub fn sidecar_scope(&self, proxy_id: &str) -> Result<Arc<SidecarScope>> {
        let con = self.require_connection(proxy_id)?;
        let push = self.push_context.current();
        Ok(con
            .proxy()
            .sidecar_scope
            .clone()
            .unwrap_or_else(|| Arc::new(SidecarScope::compute(&push, &con.proxy().namespace))))
    }

    /// Endpoints of every cluster visible to the proxy (edsz)
    pub fn endpoints(&self, proxy_id: &str) -> Result<Vec<ClusterLoadAssignment>> {
        let scope = self.sidecar_scope(proxy_id)?;
        let push = self.push_context.current();
        let mut out = Vec::new();
        for svc in scope.services.iter().filter_map(|key| push.service(key)) {
            for port in &svc.ports {
                out.push(EndpointGenerator::load_assignment(
                    &push,
                    &cluster_name(&svc.hostname, port.port),
                ));
            }
        }
        Ok(out)
    }

    /// Current push context and the configuration it was built from (configz)
    pub fn config_dump(&self) -> ConfigDump {
        let push = self.push_context.current();
        ConfigDump {
            push_context: push.summary(),
            config: push.to_snapshot(),
        }
    }

    /// Full push to every connection, skipping the debounce stage. Returns
    /// the number of connections at the time of the push.
    pub fn force_push_all(&self) -> usize {
        let count = self.registry.len();
        info!(connections = count, "Debug push triggered");
        self.push(PushRequest::full(TriggerReason::DebugTrigger));
        count
    }

    pub fn force_disconnect(&self, proxy_id: &str) -> Result<()> {
        let con = self.require_connection(proxy_id)?;
        info!(con_id = %con.con_id(), "Forcing disconnect");
        con.stop();
        Ok(())
    }
}
