//! xDS protocol types
//!
//! - `proto` - wire messages for the aggregated discovery stream
//! - `resources` - JSON resource bodies produced by the built-in generators

pub mod proto;
pub mod resources;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

/// Resource types served over ADS.
///
/// The derived ordering is the push order inside one connection: clusters
/// before endpoints, listeners before routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Cluster,
    Endpoint,
    Listener,
    Route,
}

/// Ordered set of resource types
pub type TypeSet = BTreeSet<ResourceType>;

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Cluster,
        ResourceType::Endpoint,
        ResourceType::Listener,
        ResourceType::Route,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceType::Cluster => CLUSTER_TYPE,
            ResourceType::Endpoint => ENDPOINT_TYPE,
            ResourceType::Listener => LISTENER_TYPE,
            ResourceType::Route => ROUTE_TYPE,
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        match type_url {
            CLUSTER_TYPE => Some(ResourceType::Cluster),
            ENDPOINT_TYPE => Some(ResourceType::Endpoint),
            LISTENER_TYPE => Some(ResourceType::Listener),
            ROUTE_TYPE => Some(ResourceType::Route),
            _ => None,
        }
    }

    /// Short protocol name used in logs and metric labels
    pub fn short_name(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "CDS",
            ResourceType::Endpoint => "EDS",
            ResourceType::Listener => "LDS",
            ResourceType::Route => "RDS",
        }
    }

    /// Lowercase name used for debug view field prefixes
    pub fn debug_name(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "cluster",
            ResourceType::Endpoint => "endpoint",
            ResourceType::Listener => "listener",
            ResourceType::Route => "route",
        }
    }

    /// Wildcard types treat an empty name list as "all resources" rather
    /// than as an unsubscribe.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, ResourceType::Cluster | ResourceType::Listener)
    }

    pub fn all() -> TypeSet {
        Self::ALL.into_iter().collect()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Cluster => "Cluster",
            ResourceType::Endpoint => "Endpoint",
            ResourceType::Listener => "Listener",
            ResourceType::Route => "Route",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_url_lookup() {
        for t in ResourceType::ALL {
            assert_eq!(ResourceType::from_type_url(t.type_url()), Some(t));
        }
        assert_eq!(ResourceType::from_type_url("type.googleapis.com/unknown"), None);
    }

    #[test]
    fn test_push_order() {
        let order: Vec<_> = ResourceType::all().into_iter().collect();
        assert_eq!(
            order,
            vec![
                ResourceType::Cluster,
                ResourceType::Endpoint,
                ResourceType::Listener,
                ResourceType::Route
            ]
        );
    }

    #[test]
    fn test_wildcard_types() {
        assert!(ResourceType::Cluster.is_wildcard());
        assert!(ResourceType::Listener.is_wildcard());
        assert!(!ResourceType::Endpoint.is_wildcard());
        assert!(!ResourceType::Route.is_wildcard());
    }
}
