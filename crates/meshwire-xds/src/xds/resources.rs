//! Resource bodies produced by the built-in generators
//!
//! These are serialized as JSON into the `Any` payload of a response.

use serde::{Deserialize, Serialize};

use crate::xds::proto::Locality;

/// Load balancing policy for a cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    LeastRequest,
    Random,
    RingHash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub service: String,
    pub port: u32,
    pub lb_policy: LbPolicy,
    pub outlier_detection: bool,
    /// Destination rule that shaped this cluster, as `namespace/name`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_rule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbEndpoint {
    pub address: String,
    pub port: u32,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalityLbEndpoints {
    pub locality: Option<Locality>,
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterLoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LocalityLbEndpoints>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: u32,
    pub route_config_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub clusters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfiguration {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

/// Build the outbound cluster name for a service port
pub fn cluster_name(hostname: &str, port: u32) -> String {
    format!("outbound|{}||{}", port, hostname)
}

/// Split an outbound cluster name into hostname and port
pub fn parse_cluster_name(name: &str) -> Option<(&str, u32)> {
    let mut parts = name.split('|');
    if parts.next()? != "outbound" {
        return None;
    }
    let port = parts.next()?.parse().ok()?;
    let _subset = parts.next()?;
    let hostname = parts.next()?;
    if hostname.is_empty() || parts.next().is_some() {
        return None;
    }
    Some((hostname, port))
}

/// Port encoded in a route configuration name (`80` or `http.80`)
pub fn route_port(name: &str) -> Option<u32> {
    name.strip_prefix("http.").unwrap_or(name).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_name_parsing() {
        let name = cluster_name("reviews.default.svc.cluster.local", 9080);
        assert_eq!(name, "outbound|9080||reviews.default.svc.cluster.local");
        assert_eq!(
            parse_cluster_name(&name),
            Some(("reviews.default.svc.cluster.local", 9080))
        );
        assert_eq!(parse_cluster_name("inbound|80||a"), None);
        assert_eq!(parse_cluster_name("fake-cluster"), None);
        assert_eq!(parse_cluster_name("outbound|x||a"), None);
    }

    #[test]
    fn test_route_port() {
        assert_eq!(route_port("80"), Some(80));
        assert_eq!(route_port("http.8080"), Some(8080));
        assert_eq!(route_port("https.443.https.my-gateway.testns"), None);
    }

    #[test]
    fn test_lb_policy_serde() {
        let json = serde_json::to_string(&LbPolicy::LeastRequest).unwrap();
        assert_eq!(json, "\"LEAST_REQUEST\"");
    }
}
