//! Push model: config keys, push requests and proxy metadata

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::context::PushContext;
use crate::error::{Result, XdsError};
use crate::scope::SidecarScope;
use crate::xds::proto::{Locality, Node};
use crate::xds::{ResourceType, TypeSet};

/// Kinds of mesh configuration that can trigger a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigKind {
    ServiceEntry,
    VirtualService,
    DestinationRule,
    Sidecar,
    Gateway,
    EnvoyFilter,
    AuthorizationPolicy,
    PeerAuthentication,
    RequestAuthentication,
    WorkloadEntry,
}

impl ConfigKind {
    /// Kinds whose dependencies are tracked by the sidecar scope. Everything
    /// else is assumed to affect every connection.
    pub fn is_scoped(&self) -> bool {
        matches!(
            self,
            ConfigKind::ServiceEntry
                | ConfigKind::VirtualService
                | ConfigKind::DestinationRule
                | ConfigKind::Sidecar
        )
    }

    /// Resource types a change of this kind can alter, before any
    /// proxy-specific refinement.
    pub fn affected_types(&self, full: bool) -> TypeSet {
        use ResourceType::*;
        let types: &[ResourceType] = match self {
            ConfigKind::ServiceEntry if full => &ResourceType::ALL,
            ConfigKind::ServiceEntry => &[Endpoint],
            ConfigKind::VirtualService => &[Listener, Route],
            ConfigKind::DestinationRule => &[Cluster, Endpoint],
            ConfigKind::Sidecar | ConfigKind::EnvoyFilter => &ResourceType::ALL,
            ConfigKind::Gateway => &[Listener, Route],
            ConfigKind::AuthorizationPolicy | ConfigKind::RequestAuthentication => &[Listener],
            ConfigKind::PeerAuthentication => &[Cluster, Endpoint, Listener],
            ConfigKind::WorkloadEntry => &[Endpoint],
        };
        types.iter().copied().collect()
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity of one piece of mesh configuration. For services the name is the
/// hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub kind: ConfigKind,
    pub name: String,
    pub namespace: String,
}

impl ConfigKey {
    pub fn new(kind: ConfigKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Why a push was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    EndpointUpdate,
    ConfigUpdate,
    ServiceUpdate,
    ProxyRequest,
    GlobalUpdate,
    DebugTrigger,
}

/// A change event to be fanned out to connections
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Recompute everything for the affected proxies
    pub full: bool,
    /// Changed configs; empty means "everything"
    pub configs_updated: HashSet<ConfigKey>,
    /// Restrict the push to these connection ids
    pub targets: Option<BTreeSet<String>>,
    /// Restrict the push to these resource types
    pub resource_types: Option<TypeSet>,
    pub reasons: Vec<TriggerReason>,
    pub start: Instant,
    /// Snapshot the push was computed against
    pub push: Option<Arc<PushContext>>,
}

impl PushRequest {
    pub fn full(reason: TriggerReason) -> Self {
        Self {
            full: true,
            configs_updated: HashSet::new(),
            targets: None,
            resource_types: None,
            reasons: vec![reason],
            start: Instant::now(),
            push: None,
        }
    }

    pub fn for_configs(
        full: bool,
        configs: impl IntoIterator<Item = ConfigKey>,
        reason: TriggerReason,
    ) -> Self {
        Self {
            full,
            configs_updated: configs.into_iter().collect(),
            ..Self::full(reason)
        }
    }

    /// Response to a proxy's own request: full state for the requested type
    pub fn proxy_request() -> Self {
        Self::full(TriggerReason::ProxyRequest)
    }

    pub fn with_targets(mut self, targets: impl IntoIterator<Item = String>) -> Self {
        self.targets = Some(targets.into_iter().collect());
        self
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = ResourceType>) -> Self {
        self.resource_types = Some(types.into_iter().collect());
        self
    }

    /// Combine two requests into one that covers both. An empty config set on
    /// either side means "everything" and stays that way.
    pub fn merge(mut self, other: PushRequest) -> PushRequest {
        self.full |= other.full;

        if self.configs_updated.is_empty() || other.configs_updated.is_empty() {
            self.configs_updated.clear();
        } else {
            self.configs_updated.extend(other.configs_updated);
        }

        self.targets = match (self.targets.take(), other.targets) {
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
            _ => None,
        };
        self.resource_types = match (self.resource_types.take(), other.resource_types) {
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
            _ => None,
        };

        self.reasons.extend(other.reasons);
        self.start = self.start.min(other.start);

        self.push = match (self.push.take(), other.push) {
            (Some(a), Some(b)) => Some(if b.counter() >= a.counter() { b } else { a }),
            (a, b) => a.or(b),
        };
        self
    }

    /// Copy of this request restricted to the given resource types
    pub fn scoped_to(&self, types: TypeSet) -> PushRequest {
        let mut scoped = self.clone();
        scoped.resource_types = Some(types);
        scoped
    }

    pub fn reason_labels(&self) -> Vec<TriggerReason> {
        let mut out = Vec::new();
        for r in &self.reasons {
            if !out.contains(r) {
                out.push(*r);
            }
        }
        out
    }
}

/// Metadata of a connected proxy, parsed from its node
#[derive(Debug, Clone)]
pub struct Proxy {
    /// Full node id as sent by the proxy
    pub id: String,
    pub proxy_type: String,
    pub ip: Option<String>,
    pub namespace: String,
    pub cluster: String,
    pub locality: Option<Locality>,
    pub user_agent: String,
    pub sidecar_scope: Option<Arc<SidecarScope>>,
    pub prev_sidecar_scope: Option<Arc<SidecarScope>>,
}

impl Proxy {
    /// Parse proxy metadata from the node of the first request.
    ///
    /// Node ids of the form `type~ip~workload.namespace~domain` carry the
    /// namespace; anything else falls back to `default_namespace`.
    pub fn from_node(node: &Node, default_namespace: &str) -> Result<Proxy> {
        if node.id.is_empty() {
            return Err(XdsError::Protocol("node id is required".to_string()));
        }

        let parts: Vec<&str> = node.id.split('~').collect();
        let (proxy_type, ip, namespace) = if parts.len() == 4 {
            let namespace = parts[2]
                .split_once('.')
                .map(|(_, ns)| ns)
                .or_else(|| parts[3].split('.').next())
                .filter(|ns| !ns.is_empty())
                .unwrap_or(default_namespace);
            (
                parts[0].to_string(),
                Some(parts[1].to_string()).filter(|ip| !ip.is_empty()),
                namespace.to_string(),
            )
        } else {
            ("sidecar".to_string(), None, default_namespace.to_string())
        };

        Ok(Proxy {
            id: node.id.clone(),
            proxy_type,
            ip,
            namespace,
            cluster: node.cluster.clone(),
            locality: node.locality.clone(),
            user_agent: node.user_agent_name.clone(),
            sidecar_scope: None,
            prev_sidecar_scope: None,
        })
    }

    /// Copy of this proxy with a freshly computed scope; the current scope
    /// becomes the previous one.
    pub fn with_scope(&self, scope: Arc<SidecarScope>) -> Proxy {
        let mut next = self.clone();
        next.prev_sidecar_scope = next.sidecar_scope.take();
        next.sidecar_scope = Some(scope);
        next
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn svc_key(name: &str) -> ConfigKey {
        ConfigKey::new(ConfigKind::ServiceEntry, name, "default")
    }

    #[test]
    fn test_merge_full_and_configs() {
        let a = PushRequest::for_configs(false, [svc_key("a")], TriggerReason::EndpointUpdate);
        let b = PushRequest::for_configs(true, [svc_key("b")], TriggerReason::ServiceUpdate);
        let merged = a.merge(b);
        assert!(merged.full);
        assert_eq!(merged.configs_updated.len(), 2);
        assert_eq!(
            merged.reasons,
            vec![TriggerReason::EndpointUpdate, TriggerReason::ServiceUpdate]
        );
    }

    #[test]
    fn test_merge_with_unscoped_request_is_unscoped() {
        let a = PushRequest::for_configs(true, [svc_key("a")], TriggerReason::ConfigUpdate);
        let b = PushRequest::full(TriggerReason::GlobalUpdate);
        let merged = a.merge(b);
        assert!(merged.configs_updated.is_empty());
    }

    #[test]
    fn test_merge_restrictions() {
        let a = PushRequest::full(TriggerReason::DebugTrigger)
            .with_targets(["c1".to_string()])
            .with_types([ResourceType::Cluster]);
        let b = PushRequest::full(TriggerReason::DebugTrigger)
            .with_targets(["c2".to_string()])
            .with_types([ResourceType::Route]);
        let merged = a.merge(b);
        assert_eq!(merged.targets.unwrap().len(), 2);
        assert_eq!(merged.resource_types.unwrap().len(), 2);

        let c = PushRequest::full(TriggerReason::DebugTrigger).with_types([ResourceType::Cluster]);
        let merged = c.merge(PushRequest::full(TriggerReason::GlobalUpdate));
        assert!(merged.resource_types.is_none());
        assert!(merged.targets.is_none());
    }

    #[test]
    fn test_proxy_from_sidecar_node() {
        let node = Node {
            id: "sidecar~10.1.1.1~reviews-v1.bookinfo~bookinfo.svc.cluster.local".to_string(),
            cluster: "reviews".to_string(),
            ..Default::default()
        };
        let proxy = Proxy::from_node(&node, "default").unwrap();
        assert_eq!(proxy.proxy_type, "sidecar");
        assert_eq!(proxy.ip.as_deref(), Some("10.1.1.1"));
        assert_eq!(proxy.namespace, "bookinfo");
        assert_eq!(proxy.cluster, "reviews");
    }

    #[test]
    fn test_proxy_namespace_from_domain() {
        let node = Node {
            id: "router~10.1.1.2~gateway~edge-system.svc.cluster.local".to_string(),
            ..Default::default()
        };
        let proxy = Proxy::from_node(&node, "default").unwrap();
        assert_eq!(proxy.namespace, "edge-system");
    }

    #[test]
    fn test_proxy_plain_id_and_missing_id() {
        let node = Node {
            id: "test-node".to_string(),
            ..Default::default()
        };
        let proxy = Proxy::from_node(&node, "default").unwrap();
        assert_eq!(proxy.namespace, "default");
        assert!(proxy.ip.is_none());

        assert!(Proxy::from_node(&Node::default(), "default").is_err());
    }

    #[test]
    fn test_affected_types_by_kind() {
        assert_eq!(
            ConfigKind::ServiceEntry.affected_types(false),
            [ResourceType::Endpoint].into_iter().collect()
        );
        assert_eq!(ConfigKind::ServiceEntry.affected_types(true), ResourceType::all());
        assert!(ConfigKind::DestinationRule
            .affected_types(true)
            .contains(&ResourceType::Cluster));
        assert!(!ConfigKind::VirtualService
            .affected_types(true)
            .contains(&ResourceType::Cluster));
    }

    fn arb_request() -> impl Strategy<Value = PushRequest> {
        (
            any::<bool>(),
            proptest::collection::hash_set("[a-d]", 0..3),
            proptest::option::of(proptest::collection::btree_set(0usize..4, 0..3)),
        )
            .prop_map(|(full, names, types)| {
                let mut req = PushRequest::for_configs(
                    full,
                    names.into_iter().map(|n| svc_key(&n)),
                    TriggerReason::ConfigUpdate,
                );
                req.resource_types =
                    types.map(|t| t.into_iter().map(|i| ResourceType::ALL[i]).collect());
                req
            })
    }

    proptest! {
        #[test]
        fn prop_merge_is_symmetric(a in arb_request(), b in arb_request()) {
            let ab = a.clone().merge(b.clone());
            let ba = b.merge(a);
            prop_assert_eq!(ab.full, ba.full);
            prop_assert_eq!(ab.configs_updated, ba.configs_updated);
            prop_assert_eq!(ab.resource_types, ba.resource_types);
        }

        #[test]
        fn prop_merge_never_narrows(a in arb_request(), b in arb_request()) {
            let merged = a.clone().merge(b.clone());
            prop_assert!(merged.full || (!a.full && !b.full));
            if !merged.configs_updated.is_empty() {
                prop_assert!(a.configs_updated.is_subset(&merged.configs_updated));
                prop_assert!(b.configs_updated.is_subset(&merged.configs_updated));
            }
        }
    }
}
