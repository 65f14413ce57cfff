//! Built-in generators
//!
//! Simple JSON renderings of clusters, endpoints, listeners and routes for
//! the services a proxy can see. Cluster and endpoint generation is cached per
//! push generation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cache::XdsCache;
use crate::context::PushContext;
use crate::error::Result;
use crate::generator::{Generator, GeneratorRegistry, ResourceData};
use crate::mesh::{Service, VirtualService};
use crate::model::{ConfigKind, Proxy, PushRequest};
use crate::scope::SidecarScope;
use crate::watch::WatchedResource;
use crate::xds::ResourceType;
use crate::xds::resources::{
    Cluster, ClusterLoadAssignment, LbEndpoint, Listener, LocalityLbEndpoints, Route,
    RouteConfiguration, VirtualHost, cluster_name, parse_cluster_name, route_port,
};

impl GeneratorRegistry {
    /// Registry with the built-in generator for every resource type
    pub fn with_builtin(cache: XdsCache) -> Self {
        GeneratorRegistry::new()
            .with(
                ResourceType::Cluster,
                Arc::new(ClusterGenerator::new(cache.clone())),
            )
            .with(
                ResourceType::Endpoint,
                Arc::new(EndpointGenerator::new(cache)),
            )
            .with(ResourceType::Listener, Arc::new(ListenerGenerator))
            .with(ResourceType::Route, Arc::new(RouteGenerator))
    }
}

/// Scope the proxy was last computed with, or a fresh one
fn scope_of(proxy: &Proxy, push: &PushContext) -> Arc<SidecarScope> {
    proxy
        .sidecar_scope
        .clone()
        .unwrap_or_else(|| Arc::new(SidecarScope::compute(push, &proxy.namespace)))
}

fn visible_services<'a>(
    scope: &'a SidecarScope,
    push: &'a PushContext,
) -> impl Iterator<Item = &'a Service> {
    scope.services.iter().filter_map(|key| push.service(key))
}

pub struct ClusterGenerator {
    cache: XdsCache,
}

impl ClusterGenerator {
    pub fn new(cache: XdsCache) -> Self {
        Self { cache }
    }
}

impl Generator for ClusterGenerator {
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        _watched: &WatchedResource,
        _request: &PushRequest,
    ) -> Result<Option<Vec<ResourceData>>> {
        let scope = scope_of(proxy, push);
        let key = XdsCache::key(
            ResourceType::Cluster,
            &format!("{:016x}", scope.fingerprint()),
            push.version_prefix(),
        );
        let clusters = self.cache.get_or_build(key, || {
            let mut out = Vec::new();
            for svc in visible_services(&scope, push) {
                let rule = push.destination_rule_for(&svc.hostname);
                for port in &svc.ports {
                    let cluster = Cluster {
                        name: cluster_name(&svc.hostname, port.port),
                        service: svc.hostname.clone(),
                        port: port.port,
                        lb_policy: rule.map(|r| r.lb_policy).unwrap_or_default(),
                        outlier_detection: rule.is_some_and(|r| r.outlier_detection),
                        destination_rule: rule.map(|r| r.config_ref().to_string()),
                    };
                    out.push(ResourceData::json(
                        ResourceType::Cluster,
                        cluster.name.clone(),
                        &cluster,
                    )?);
                }
            }
            Ok::<_, crate::error::XdsError>(out)
        })?;
        Ok(Some(clusters.as_ref().clone()))
    }
}

pub struct EndpointGenerator {
    cache: XdsCache,
}

impl EndpointGenerator {
    pub fn new(cache: XdsCache) -> Self {
        Self { cache }
    }

    pub(crate) fn load_assignment(push: &PushContext, name: &str) -> ClusterLoadAssignment {
        let mut by_locality: BTreeMap<String, LocalityLbEndpoints> = BTreeMap::new();
        if let Some((hostname, _port)) = parse_cluster_name(name) {
            for ep in push.endpoints(hostname) {
                let group_key = ep
                    .locality
                    .as_ref()
                    .map(|l| format!("{}/{}/{}", l.region, l.zone, l.sub_zone))
                    .unwrap_or_default();
                by_locality
                    .entry(group_key)
                    .or_insert_with(|| LocalityLbEndpoints {
                        locality: ep.locality.clone(),
                        lb_endpoints: Vec::new(),
                    })
                    .lb_endpoints
                    .push(LbEndpoint {
                        address: ep.address.clone(),
                        port: ep.port,
                        weight: ep.weight,
                    });
            }
        }
        ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: by_locality.into_values().collect(),
        }
    }
}

impl Generator for EndpointGenerator {
    fn generate(
        &self,
        _proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        request: &PushRequest,
    ) -> Result<Option<Vec<ResourceData>>> {
        // Incremental endpoint pushes only carry clusters whose service changed
        if !request.full && !request.configs_updated.is_empty() {
            let updated: BTreeSet<&str> = request
                .configs_updated
                .iter()
                .filter(|k| k.kind == ConfigKind::ServiceEntry)
                .map(|k| k.name.as_str())
                .collect();
            let touched = watched.resource_names.iter().any(|name| {
                parse_cluster_name(name).is_some_and(|(host, _)| updated.contains(host))
            });
            if !touched {
                return Ok(None);
            }
        }

        let mut out = Vec::with_capacity(watched.resource_names.len());
        for name in &watched.resource_names {
            let key = XdsCache::key(ResourceType::Endpoint, name, push.version_prefix());
            let built = self.cache.get_or_build(key, || {
                let cla = Self::load_assignment(push, name);
                ResourceData::json(ResourceType::Endpoint, name.clone(), &cla).map(|r| vec![r])
            })?;
            out.extend(built.iter().cloned());
        }
        Ok(Some(out))
    }
}

pub struct ListenerGenerator;

impl Generator for ListenerGenerator {
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        _watched: &WatchedResource,
        _request: &PushRequest,
    ) -> Result<Option<Vec<ResourceData>>> {
        let scope = scope_of(proxy, push);
        let ports: BTreeSet<u32> = visible_services(&scope, push)
            .flat_map(|svc| svc.ports.iter().map(|p| p.port))
            .collect();

        let mut out = Vec::with_capacity(ports.len());
        for port in ports {
            let listener = Listener {
                name: format!("0.0.0.0_{}", port),
                address: "0.0.0.0".to_string(),
                port,
                route_config_name: port.to_string(),
            };
            out.push(ResourceData::json(
                ResourceType::Listener,
                listener.name.clone(),
                &listener,
            )?);
        }
        Ok(Some(out))
    }
}

pub struct RouteGenerator;

impl RouteGenerator {
    fn route_configuration(
        scope: &SidecarScope,
        push: &PushContext,
        name: &str,
    ) -> RouteConfiguration {
        let Some(port) = route_port(name) else {
            return RouteConfiguration {
                name: name.to_string(),
                ..Default::default()
            };
        };

        let on_port: BTreeSet<&str> = visible_services(scope, push)
            .filter(|svc| svc.ports.iter().any(|p| p.port == port))
            .map(|svc| svc.hostname.as_str())
            .collect();

        let mut routed: BTreeSet<&str> = BTreeSet::new();
        let mut virtual_hosts = Vec::new();
        for vs in scope
            .virtual_services
            .iter()
            .filter_map(|r| push.virtual_service(r))
        {
            let domains: Vec<String> = vs
                .hosts
                .iter()
                .filter(|h| on_port.contains(h.as_str()))
                .cloned()
                .collect();
            if domains.is_empty() {
                continue;
            }
            routed.extend(vs.hosts.iter().map(String::as_str));
            virtual_hosts.push(VirtualHost {
                name: format!("{}:{}", vs.config_ref(), port),
                domains,
                routes: Self::routes(vs, push, port),
            });
        }

        for host in on_port.difference(&routed) {
            virtual_hosts.push(VirtualHost {
                name: format!("{}:{}", host, port),
                domains: vec![host.to_string()],
                routes: vec![Route {
                    name: "default".to_string(),
                    clusters: vec![cluster_name(host, port)],
                }],
            });
        }

        RouteConfiguration {
            name: name.to_string(),
            virtual_hosts,
        }
    }

    fn routes(vs: &VirtualService, push: &PushContext, port: u32) -> Vec<Route> {
        vs.http
            .iter()
            .map(|http| {
                let mut destinations: Vec<&str> =
                    http.destinations.iter().map(String::as_str).collect();
                if let Some(delegate) = http.delegate.as_ref().and_then(|d| push.virtual_service(d))
                {
                    destinations.extend(delegate.destinations());
                }
                Route {
                    name: http.name.clone(),
                    clusters: destinations
                        .into_iter()
                        .map(|d| cluster_name(d, port))
                        .collect(),
                }
            })
            .collect()
    }
}

impl Generator for RouteGenerator {
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        _request: &PushRequest,
    ) -> Result<Option<Vec<ResourceData>>> {
        let scope = scope_of(proxy, push);
        watched
            .resource_names
            .iter()
            .map(|name| {
                let config = Self::route_configuration(&scope, push, name);
                ResourceData::json(ResourceType::Route, name.clone(), &config)
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}
