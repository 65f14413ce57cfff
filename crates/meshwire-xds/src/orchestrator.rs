//! Push fan-out decisions
//!
//! For one connection and one push request, work out which resource types
//! (if any) have to be regenerated.

use std::sync::Arc;

use crate::connection::Connection;
use crate::context::PushContext;
use crate::model::{ConfigKey, ConfigKind, PushRequest};
use crate::scope::SidecarScope;
use crate::xds::{ResourceType, TypeSet};

/// Resource types `con` must receive for `request`, or `None` when the push
/// does not concern it.
///
/// Full pushes recompute the connection's sidecar scope first; the previous
/// scope is kept so that a deleted config still reaches the proxies that
/// used to depend on it.
pub fn proxy_needs_push(
    con: &Connection,
    request: &PushRequest,
    push: &PushContext,
) -> Option<TypeSet> {
    let watched = con.watched_types();
    if watched.is_empty() {
        return None;
    }

    if request.full {
        let namespace = con.proxy().namespace.clone();
        con.update_scope(Arc::new(SidecarScope::compute(push, &namespace)));
    }

    let mut types = if request.configs_updated.is_empty() {
        if request.full {
            ResourceType::all()
        } else {
            TypeSet::from([ResourceType::Endpoint])
        }
    } else {
        let (current, previous) = con.scopes();
        affected_types(request, push, current.as_deref(), previous.as_deref())
    };

    if let Some(only) = &request.resource_types {
        types.retain(|t| only.contains(t));
    }
    types.retain(|t| watched.contains(t));

    if types.is_empty() { None } else { Some(types) }
}

fn affected_types(
    request: &PushRequest,
    push: &PushContext,
    current: Option<&SidecarScope>,
    previous: Option<&SidecarScope>,
) -> TypeSet {
    let root = push.root_namespace();
    let depends = |key: &ConfigKey| match (current, previous) {
        (None, None) => true,
        _ => [current, previous]
            .into_iter()
            .flatten()
            .any(|scope| scope.depends_on(key, root)),
    };

    let mut types = TypeSet::new();
    for key in &request.configs_updated {
        if key.kind.is_scoped() && !depends(key) {
            continue;
        }
        match key.kind {
            ConfigKind::VirtualService => {
                types.extend(virtual_service_types(key, current, previous));
            }
            kind => types.extend(kind.affected_types(request.full)),
        }
    }
    types
}

/// A delegate change can reshape the whole route tree, so it touches
/// everything downstream. A root change only reaches clusters when the set
/// of visible services moved with it.
fn virtual_service_types(
    key: &ConfigKey,
    current: Option<&SidecarScope>,
    previous: Option<&SidecarScope>,
) -> TypeSet {
    let is_delegate = [current, previous]
        .into_iter()
        .flatten()
        .any(|scope| scope.is_delegate(key));
    if is_delegate {
        return ResourceType::all();
    }

    let mut types = ConfigKind::VirtualService.affected_types(true);
    if let (Some(current), Some(previous)) = (current, previous)
        && current.services != previous.services
    {
        types.insert(ResourceType::Cluster);
        types.insert(ResourceType::Endpoint);
    }
    types
}
