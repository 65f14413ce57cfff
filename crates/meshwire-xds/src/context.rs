//! Push context: the immutable mesh view one push generation is computed from

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::mesh::{
    ConfigRef, DestinationRule, MeshSnapshot, Service, ServiceKey, Sidecar, VirtualService,
    WorkloadEndpoint,
};

/// Length of the encoded counter that prefixes every version and nonce.
/// A base64 encoding of 8 bytes is always 12 characters.
pub const VERSION_PREFIX_LEN: usize = 12;

/// Encode a push counter into its fixed-length version prefix
pub fn encode_version(counter: u64) -> String {
    STANDARD.encode(counter.to_be_bytes())
}

/// Config generation prefix of a version or nonce
pub fn version_prefix(value: &str) -> Option<&str> {
    value.get(..VERSION_PREFIX_LEN)
}

/// Fresh nonce for one response computed from the given version
pub fn next_nonce(version: &str) -> String {
    let prefix = version_prefix(version).unwrap_or(version);
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

#[derive(Debug)]
pub struct PushContext {
    counter: u64,
    version: String,
    created_at: DateTime<Utc>,
    root_namespace: String,
    services: BTreeMap<ServiceKey, Service>,
    services_by_host: HashMap<String, Vec<ServiceKey>>,
    endpoints: Arc<BTreeMap<String, Vec<WorkloadEndpoint>>>,
    virtual_services: BTreeMap<ConfigRef, VirtualService>,
    /// delegate -> root virtual services that reference it
    delegate_roots: HashMap<ConfigRef, BTreeSet<ConfigRef>>,
    destination_rules: BTreeMap<ConfigRef, DestinationRule>,
    sidecars: BTreeMap<ConfigRef, Sidecar>,
    revisions: BTreeMap<String, u64>,
}

impl PushContext {
    pub fn build(counter: u64, snapshot: MeshSnapshot, root_namespace: &str) -> PushContext {
        let created_at = Utc::now();

        let mut services = BTreeMap::new();
        let mut services_by_host: HashMap<String, Vec<ServiceKey>> = HashMap::new();
        for svc in snapshot.services {
            let key = svc.key();
            services_by_host
                .entry(svc.hostname.clone())
                .or_default()
                .push(key.clone());
            services.insert(key, svc);
        }

        let mut virtual_services = BTreeMap::new();
        let mut delegate_roots: HashMap<ConfigRef, BTreeSet<ConfigRef>> = HashMap::new();
        for vs in snapshot.virtual_services {
            let root = vs.config_ref();
            for delegate in vs.delegates() {
                delegate_roots
                    .entry(delegate.clone())
                    .or_default()
                    .insert(root.clone());
            }
            virtual_services.insert(root, vs);
        }

        PushContext {
            counter,
            version: format_version(counter, created_at),
            created_at,
            root_namespace: root_namespace.to_string(),
            services,
            services_by_host,
            endpoints: Arc::new(snapshot.endpoints),
            virtual_services,
            delegate_roots,
            destination_rules: snapshot
                .destination_rules
                .into_iter()
                .map(|dr| (dr.config_ref(), dr))
                .collect(),
            sidecars: snapshot
                .sidecars
                .into_iter()
                .map(|sc| (sc.config_ref(), sc))
                .collect(),
            revisions: snapshot.revisions,
        }
    }

    /// New generation sharing everything with `self` except the endpoints
    pub fn with_endpoints(
        &self,
        counter: u64,
        endpoints: BTreeMap<String, Vec<WorkloadEndpoint>>,
    ) -> PushContext {
        let created_at = Utc::now();
        PushContext {
            counter,
            version: format_version(counter, created_at),
            created_at,
            root_namespace: self.root_namespace.clone(),
            services: self.services.clone(),
            services_by_host: self.services_by_host.clone(),
            endpoints: Arc::new(endpoints),
            virtual_services: self.virtual_services.clone(),
            delegate_roots: self.delegate_roots.clone(),
            destination_rules: self.destination_rules.clone(),
            sidecars: self.sidecars.clone(),
            revisions: self.revisions.clone(),
        }
    }

    pub fn empty(root_namespace: &str) -> PushContext {
        Self::build(0, MeshSnapshot::default(), root_namespace)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn version_prefix(&self) -> &str {
        version_prefix(&self.version).unwrap_or(&self.version)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn root_namespace(&self) -> &str {
        &self.root_namespace
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn service(&self, key: &ServiceKey) -> Option<&Service> {
        self.services.get(key)
    }

    pub fn services_for_host(&self, hostname: &str) -> impl Iterator<Item = &Service> {
        self.services_by_host
            .get(hostname)
            .into_iter()
            .flatten()
            .filter_map(|key| self.services.get(key))
    }

    pub fn endpoints(&self, hostname: &str) -> &[WorkloadEndpoint] {
        self.endpoints
            .get(hostname)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn virtual_services(&self) -> impl Iterator<Item = &VirtualService> {
        self.virtual_services.values()
    }

    pub fn virtual_service(&self, r: &ConfigRef) -> Option<&VirtualService> {
        self.virtual_services.get(r)
    }

    /// Root virtual services that hand off to the given delegate
    pub fn delegate_roots(&self, delegate: &ConfigRef) -> impl Iterator<Item = &ConfigRef> {
        self.delegate_roots.get(delegate).into_iter().flatten()
    }

    pub fn destination_rules(&self) -> impl Iterator<Item = &DestinationRule> {
        self.destination_rules.values()
    }

    pub fn destination_rule_for(&self, hostname: &str) -> Option<&DestinationRule> {
        self.destination_rules.values().find(|dr| dr.host == hostname)
    }

    /// Sidecar governing proxies in `namespace`: the namespace's own, else
    /// the mesh-wide one in the root namespace
    pub fn sidecar_for(&self, namespace: &str) -> Option<&Sidecar> {
        self.sidecars
            .values()
            .find(|sc| sc.namespace == namespace)
            .or_else(|| {
                self.sidecars
                    .values()
                    .find(|sc| sc.namespace == self.root_namespace)
            })
    }

    pub fn revisions(&self) -> &BTreeMap<String, u64> {
        &self.revisions
    }

    /// Debug summary of the indexed configuration
    pub fn summary(&self) -> PushContextSummary {
        PushContextSummary {
            version: self.version.clone(),
            created_at: self.created_at,
            services: self.services.len(),
            endpoints: self.endpoints.values().map(Vec::len).sum(),
            virtual_services: self.virtual_services.len(),
            destination_rules: self.destination_rules.len(),
            sidecars: self.sidecars.len(),
        }
    }

    /// Owned copy of the configuration this context indexes
    pub fn to_snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            services: self.services.values().cloned().collect(),
            endpoints: (*self.endpoints).clone(),
            virtual_services: self.virtual_services.values().cloned().collect(),
            destination_rules: self.destination_rules.values().cloned().collect(),
            sidecars: self.sidecars.values().cloned().collect(),
            revisions: self.revisions.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PushContextSummary {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub services: usize,
    pub endpoints: usize,
    pub virtual_services: usize,
    pub destination_rules: usize,
    pub sidecars: usize,
}

fn format_version(counter: u64, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}",
        encode_version(counter),
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Holder of the current push context. Readers clone the `Arc` and never
/// wait on a rebuild; a new context is swapped in whole.
pub struct PushContextHolder {
    current: RwLock<Arc<PushContext>>,
}

impl PushContextHolder {
    pub fn new(initial: PushContext) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn current(&self) -> Arc<PushContext> {
        self.current.read().clone()
    }

    pub fn swap(&self, next: Arc<PushContext>) -> Arc<PushContext> {
        std::mem::replace(&mut *self.current.write(), next)
    }
}
