//! Sidecar scope: the slice of the mesh one proxy can see
//!
//! A scope is derived from the governing Sidecar's egress hosts and records
//! every config the proxy's generated resources depend on. The orchestrator
//! uses it to prune pushes that cannot affect a proxy.

use std::collections::BTreeSet;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::Serialize;

use crate::context::PushContext;
use crate::mesh::{ConfigRef, ServiceKey};
use crate::model::{ConfigKey, ConfigKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
enum NamespaceMatch {
    Any,
    Local,
    None,
    Exact(String),
}

/// One `namespace/host` egress entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EgressHost {
    namespace: NamespaceMatch,
    host: String,
}

impl EgressHost {
    /// Parse `ns/host`. A bare host applies to every namespace.
    pub fn parse(value: &str) -> EgressHost {
        let (ns, host) = value.split_once('/').unwrap_or(("*", value));
        let namespace = match ns {
            "*" => NamespaceMatch::Any,
            "." => NamespaceMatch::Local,
            "~" => NamespaceMatch::None,
            other => NamespaceMatch::Exact(other.to_string()),
        };
        EgressHost {
            namespace,
            host: host.to_string(),
        }
    }

    pub fn matches(&self, config_namespace: &str, hostname: &str, proxy_namespace: &str) -> bool {
        let ns_ok = match &self.namespace {
            NamespaceMatch::Any => true,
            NamespaceMatch::Local => config_namespace == proxy_namespace,
            NamespaceMatch::None => false,
            NamespaceMatch::Exact(ns) => config_namespace == ns,
        };
        ns_ok && host_matches(&self.host, hostname)
    }
}

/// `*` matches anything, `*.suffix` matches any host ending in `.suffix`.
pub fn host_matches(pattern: &str, hostname: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix('*') {
        Some(suffix) => hostname.ends_with(suffix) && hostname.len() > suffix.len(),
        None => pattern == hostname,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SidecarScope {
    pub namespace: String,
    /// Sidecar the scope was derived from, if any
    pub sidecar: Option<ConfigRef>,
    egress: Vec<EgressHost>,
    pub services: BTreeSet<ServiceKey>,
    pub virtual_services: BTreeSet<ConfigRef>,
    pub delegates: BTreeSet<ConfigRef>,
    pub destination_rules: BTreeSet<ConfigRef>,
    fingerprint: u64,
}

impl SidecarScope {
    pub fn compute(push: &PushContext, proxy_namespace: &str) -> SidecarScope {
        let sidecar = push.sidecar_for(proxy_namespace);
        let egress: Vec<EgressHost> = match sidecar {
            Some(sc) if !sc.egress_hosts.is_empty() => {
                sc.egress_hosts.iter().map(|h| EgressHost::parse(h)).collect()
            }
            _ => vec![EgressHost::parse("*/*")],
        };
        let visible =
            |ns: &str, host: &str| egress.iter().any(|e| e.matches(ns, host, proxy_namespace));

        let mut services: BTreeSet<ServiceKey> = push
            .services()
            .filter(|svc| visible(&svc.namespace, &svc.hostname))
            .map(|svc| svc.key())
            .collect();

        let mut virtual_services = BTreeSet::new();
        let mut delegates = BTreeSet::new();
        let mut destinations: BTreeSet<String> = BTreeSet::new();
        for vs in push.virtual_services().filter(|vs| !vs.is_delegate()) {
            if !vs.hosts.iter().any(|h| visible(&vs.namespace, h)) {
                continue;
            }
            virtual_services.insert(vs.config_ref());
            destinations.extend(vs.destinations().map(str::to_string));
            for delegate in vs.delegates() {
                delegates.insert(delegate.clone());
                if let Some(d) = push.virtual_service(delegate) {
                    destinations.extend(d.destinations().map(str::to_string));
                }
            }
        }
        for host in &destinations {
            services.extend(push.services_for_host(host).map(|svc| svc.key()));
        }

        let destination_rules = push
            .destination_rules()
            .filter(|dr| services.iter().any(|s| host_matches(&dr.host, &s.hostname)))
            .map(|dr| dr.config_ref())
            .collect();

        let mut hasher = DefaultHasher::new();
        services.hash(&mut hasher);
        virtual_services.hash(&mut hasher);
        delegates.hash(&mut hasher);
        let fingerprint = hasher.finish();

        SidecarScope {
            namespace: proxy_namespace.to_string(),
            sidecar: sidecar.map(|sc| sc.config_ref()),
            egress,
            services,
            virtual_services,
            delegates,
            destination_rules,
            fingerprint,
        }
    }

    /// Whether resources generated under this scope depend on `key`
    pub fn depends_on(&self, key: &ConfigKey, root_namespace: &str) -> bool {
        match key.kind {
            ConfigKind::ServiceEntry => self
                .services
                .contains(&ServiceKey::new(&key.namespace, &key.name)),
            ConfigKind::VirtualService => {
                let r = ConfigRef::new(&key.namespace, &key.name);
                self.virtual_services.contains(&r) || self.delegates.contains(&r)
            }
            ConfigKind::DestinationRule => self
                .destination_rules
                .contains(&ConfigRef::new(&key.namespace, &key.name)),
            ConfigKind::Sidecar => {
                key.namespace == self.namespace || key.namespace == root_namespace
            }
            _ => true,
        }
    }

    pub fn is_delegate(&self, key: &ConfigKey) -> bool {
        key.kind == ConfigKind::VirtualService
            && self
                .delegates
                .contains(&ConfigRef::new(&key.namespace, &key.name))
    }

    /// Hash of the visible services and routes; equal fingerprints generate
    /// equal clusters for the same push context.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}
