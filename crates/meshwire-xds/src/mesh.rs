//! Mesh configuration model
//!
//! The subset of mesh configuration the engine indexes into a push context.
//! Everything here is plain data and can be loaded from YAML.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{ConfigKey, ConfigKind};
use crate::xds::proto::Locality;
use crate::xds::resources::LbPolicy;

/// `(namespace, name)` reference to a namespaced config
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigRef {
    pub namespace: String,
    pub name: String,
}

impl ConfigRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ConfigRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "HTTP".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub hostname: String,
    pub namespace: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.namespace, &self.hostname)
    }
}

/// `(namespace, hostname)` identity of a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub hostname: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            hostname: hostname.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadEndpoint {
    pub address: String,
    pub port: u32,
    #[serde(default)]
    pub locality: Option<Locality>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRoute {
    #[serde(default)]
    pub name: String,
    /// Destination hostnames
    #[serde(default)]
    pub destinations: Vec<String>,
    /// Delegate virtual service this route hands off to
    #[serde(default)]
    pub delegate: Option<ConfigRef>,
}

/// Routing rules. A virtual service without hosts is a delegate that only
/// takes effect through a root that references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualService {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub http: Vec<HttpRoute>,
}

impl VirtualService {
    pub fn config_ref(&self) -> ConfigRef {
        ConfigRef::new(&self.namespace, &self.name)
    }

    pub fn is_delegate(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn delegates(&self) -> impl Iterator<Item = &ConfigRef> {
        self.http.iter().filter_map(|r| r.delegate.as_ref())
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.http
            .iter()
            .flat_map(|r| r.destinations.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationRule {
    pub name: String,
    pub namespace: String,
    pub host: String,
    #[serde(default)]
    pub lb_policy: LbPolicy,
    #[serde(default)]
    pub outlier_detection: bool,
}

impl DestinationRule {
    pub fn config_ref(&self) -> ConfigRef {
        ConfigRef::new(&self.namespace, &self.name)
    }
}

/// Egress visibility for proxies in one namespace (or the whole mesh when it
/// lives in the root namespace)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub egress_hosts: Vec<String>,
}

impl Sidecar {
    pub fn config_ref(&self) -> ConfigRef {
        ConfigRef::new(&self.namespace, &self.name)
    }
}

/// Owned view of the whole mesh configuration at one instant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshSnapshot {
    #[serde(default)]
    pub services: Vec<Service>,
    /// Endpoints keyed by service hostname
    #[serde(default)]
    pub endpoints: BTreeMap<String, Vec<WorkloadEndpoint>>,
    #[serde(default)]
    pub virtual_services: Vec<VirtualService>,
    #[serde(default)]
    pub destination_rules: Vec<DestinationRule>,
    #[serde(default)]
    pub sidecars: Vec<Sidecar>,
    /// Revision of each config, keyed by `ConfigKey` display form
    #[serde(default, skip_deserializing)]
    pub revisions: BTreeMap<String, u64>,
}

impl MeshSnapshot {
    pub fn from_yaml(text: &str) -> crate::error::Result<MeshSnapshot> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Keys of every config in the snapshot
    pub fn keys(&self) -> Vec<ConfigKey> {
        let mut keys = Vec::new();
        keys.extend(
            self.services
                .iter()
                .map(|s| ConfigKey::new(ConfigKind::ServiceEntry, &s.hostname, &s.namespace)),
        );
        keys.extend(
            self.virtual_services
                .iter()
                .map(|v| ConfigKey::new(ConfigKind::VirtualService, &v.name, &v.namespace)),
        );
        keys.extend(
            self.destination_rules
                .iter()
                .map(|d| ConfigKey::new(ConfigKind::DestinationRule, &d.name, &d.namespace)),
        );
        keys.extend(
            self.sidecars
                .iter()
                .map(|s| ConfigKey::new(ConfigKind::Sidecar, &s.name, &s.namespace)),
        );
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_from_yaml() {
        let yaml = r#"
services:
  - hostname: reviews.bookinfo.svc.cluster.local
    namespace: bookinfo
    ports:
      - name: http
        port: 9080
endpoints:
  reviews.bookinfo.svc.cluster.local:
    - address: 10.0.0.5
      port: 9080
virtual_services:
  - name: reviews-root
    namespace: bookinfo
    hosts: [reviews.bookinfo.svc.cluster.local]
    http:
      - name: to-delegate
        delegate:
          namespace: bookinfo
          name: reviews-delegate
  - name: reviews-delegate
    namespace: bookinfo
    http:
      - destinations: [reviews.bookinfo.svc.cluster.local]
destination_rules:
  - name: reviews
    namespace: bookinfo
    host: reviews.bookinfo.svc.cluster.local
    lb_policy: LEAST_REQUEST
sidecars:
  - name: default
    namespace: bookinfo
    egress_hosts: ["./*"]
"#;
        let snapshot = MeshSnapshot::from_yaml(yaml).unwrap();
        assert_eq!(snapshot.services.len(), 1);
        assert_eq!(snapshot.services[0].ports[0].protocol, "HTTP");
        assert_eq!(snapshot.endpoints.values().next().unwrap()[0].weight, 1);
        assert!(!snapshot.virtual_services[0].is_delegate());
        assert!(snapshot.virtual_services[1].is_delegate());
        assert_eq!(
            snapshot.virtual_services[0].delegates().next(),
            Some(&ConfigRef::new("bookinfo", "reviews-delegate"))
        );
        assert_eq!(snapshot.destination_rules[0].lb_policy, LbPolicy::LeastRequest);
        assert_eq!(snapshot.keys().len(), 5);
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(MeshSnapshot::from_yaml("services: 3").is_err());
    }
}
