//! In-memory mesh configuration store
//!
//! Stands in for the external config registry: it owns the current mesh
//! configuration, stamps each write with a revision and tells subscribers
//! which config changed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::mesh::{DestinationRule, MeshSnapshot, Service, Sidecar, VirtualService, WorkloadEndpoint};
use crate::model::{ConfigKey, ConfigKind};

/// Source of mesh configuration for push context construction
pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> MeshSnapshot;
}

/// A single change emitted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEvent {
    pub key: ConfigKey,
    /// Only the endpoints of a service changed
    pub endpoints_only: bool,
}

pub type ConfigHandler = Arc<dyn Fn(ConfigEvent) + Send + Sync>;

#[derive(Default)]
struct StoreState {
    services: BTreeMap<(String, String), Service>,
    endpoints: BTreeMap<String, Vec<WorkloadEndpoint>>,
    virtual_services: BTreeMap<(String, String), VirtualService>,
    destination_rules: BTreeMap<(String, String), DestinationRule>,
    sidecars: BTreeMap<(String, String), Sidecar>,
    revisions: BTreeMap<String, u64>,
}

pub struct MemoryConfigStore {
    state: RwLock<StoreState>,
    revision: AtomicU64,
    handlers: RwLock<Vec<ConfigHandler>>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            revision: AtomicU64::new(0),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Seed a store from a snapshot without emitting events
    pub fn from_snapshot(snapshot: MeshSnapshot) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write();
            for svc in snapshot.services {
                let key = ConfigKey::new(ConfigKind::ServiceEntry, &svc.hostname, &svc.namespace);
                state.revisions.insert(key.to_string(), store.next_revision());
                state
                    .services
                    .insert((svc.namespace.clone(), svc.hostname.clone()), svc);
            }
            state.endpoints = snapshot.endpoints;
            for vs in snapshot.virtual_services {
                let key = ConfigKey::new(ConfigKind::VirtualService, &vs.name, &vs.namespace);
                state.revisions.insert(key.to_string(), store.next_revision());
                state
                    .virtual_services
                    .insert((vs.namespace.clone(), vs.name.clone()), vs);
            }
            for dr in snapshot.destination_rules {
                let key = ConfigKey::new(ConfigKind::DestinationRule, &dr.name, &dr.namespace);
                state.revisions.insert(key.to_string(), store.next_revision());
                state
                    .destination_rules
                    .insert((dr.namespace.clone(), dr.name.clone()), dr);
            }
            for sc in snapshot.sidecars {
                let key = ConfigKey::new(ConfigKind::Sidecar, &sc.name, &sc.namespace);
                state.revisions.insert(key.to_string(), store.next_revision());
                state.sidecars.insert((sc.namespace.clone(), sc.name.clone()), sc);
            }
        }
        store
    }

    pub fn register_handler(&self, handler: ConfigHandler) {
        self.handlers.write().push(handler);
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, key: ConfigKey, endpoints_only: bool) {
        debug!(config = %key, endpoints_only, "Config changed");
        let handlers = self.handlers.read().clone();
        let event = ConfigEvent { key, endpoints_only };
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn bump(&self, state: &mut StoreState, key: &ConfigKey) {
        state.revisions.insert(key.to_string(), self.next_revision());
    }

    fn forget(state: &mut StoreState, key: &ConfigKey) {
        state.revisions.remove(&key.to_string());
    }

    pub fn add_service(&self, service: Service) {
        let key = ConfigKey::new(ConfigKind::ServiceEntry, &service.hostname, &service.namespace);
        {
            let mut state = self.state.write();
            self.bump(&mut state, &key);
            state
                .services
                .insert((service.namespace.clone(), service.hostname.clone()), service);
        }
        self.notify(key, false);
    }

    pub fn remove_service(&self, namespace: &str, hostname: &str) -> bool {
        let key = ConfigKey::new(ConfigKind::ServiceEntry, hostname, namespace);
        let removed = {
            let mut state = self.state.write();
            Self::forget(&mut state, &key);
            state
                .services
                .remove(&(namespace.to_string(), hostname.to_string()))
                .is_some()
        };
        if removed {
            self.notify(key, false);
        }
        removed
    }

    /// Replace the endpoints of a service. Emits an endpoint-only event.
    pub fn set_endpoints(&self, namespace: &str, hostname: &str, endpoints: Vec<WorkloadEndpoint>) {
        let key = ConfigKey::new(ConfigKind::ServiceEntry, hostname, namespace);
        {
            let mut state = self.state.write();
            if endpoints.is_empty() {
                state.endpoints.remove(hostname);
            } else {
                state.endpoints.insert(hostname.to_string(), endpoints);
            }
        }
        self.notify(key, true);
    }

    pub fn upsert_virtual_service(&self, vs: VirtualService) {
        let key = ConfigKey::new(ConfigKind::VirtualService, &vs.name, &vs.namespace);
        {
            let mut state = self.state.write();
            self.bump(&mut state, &key);
            state
                .virtual_services
                .insert((vs.namespace.clone(), vs.name.clone()), vs);
        }
        self.notify(key, false);
    }

    pub fn delete_virtual_service(&self, namespace: &str, name: &str) -> bool {
        let key = ConfigKey::new(ConfigKind::VirtualService, name, namespace);
        let removed = {
            let mut state = self.state.write();
            Self::forget(&mut state, &key);
            state
                .virtual_services
                .remove(&(namespace.to_string(), name.to_string()))
                .is_some()
        };
        if removed {
            self.notify(key, false);
        }
        removed
    }

    pub fn upsert_destination_rule(&self, dr: DestinationRule) {
        let key = ConfigKey::new(ConfigKind::DestinationRule, &dr.name, &dr.namespace);
        {
            let mut state = self.state.write();
            self.bump(&mut state, &key);
            state
                .destination_rules
                .insert((dr.namespace.clone(), dr.name.clone()), dr);
        }
        self.notify(key, false);
    }

    pub fn delete_destination_rule(&self, namespace: &str, name: &str) -> bool {
        let key = ConfigKey::new(ConfigKind::DestinationRule, name, namespace);
        let removed = {
            let mut state = self.state.write();
            Self::forget(&mut state, &key);
            state
                .destination_rules
                .remove(&(namespace.to_string(), name.to_string()))
                .is_some()
        };
        if removed {
            self.notify(key, false);
        }
        removed
    }

    pub fn upsert_sidecar(&self, sidecar: Sidecar) {
        let key = ConfigKey::new(ConfigKind::Sidecar, &sidecar.name, &sidecar.namespace);
        {
            let mut state = self.state.write();
            self.bump(&mut state, &key);
            state
                .sidecars
                .insert((sidecar.namespace.clone(), sidecar.name.clone()), sidecar);
        }
        self.notify(key, false);
    }

    pub fn delete_sidecar(&self, namespace: &str, name: &str) -> bool {
        let key = ConfigKey::new(ConfigKind::Sidecar, name, namespace);
        let removed = {
            let mut state = self.state.write();
            Self::forget(&mut state, &key);
            state
                .sidecars
                .remove(&(namespace.to_string(), name.to_string()))
                .is_some()
        };
        if removed {
            self.notify(key, false);
        }
        removed
    }
}

impl ConfigSource for MemoryConfigStore {
    fn snapshot(&self) -> MeshSnapshot {
        let state = self.state.read();
        MeshSnapshot {
            services: state.services.values().cloned().collect(),
            endpoints: state.endpoints.clone(),
            virtual_services: state.virtual_services.values().cloned().collect(),
            destination_rules: state.destination_rules.values().cloned().collect(),
            sidecars: state.sidecars.values().cloned().collect(),
            revisions: state.revisions.clone(),
        }
    }
}
