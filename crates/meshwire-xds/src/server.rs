//! Discovery server
//!
//! Owns the connection registry, the push queue and the current push
//! context, and turns config change events into per-connection pushes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::XdsCache;
use crate::connection::PushEvent;
use crate::context::{PushContext, PushContextHolder};
use crate::debounce::{DebounceOptions, debounce};
use crate::error::{Result, XdsError};
use crate::generator::GeneratorRegistry;
use crate::ledger::Ledger;
use crate::metrics;
use crate::model::{ConfigKind, PushRequest, TriggerReason};
use crate::orchestrator::proxy_needs_push;
use crate::queue::PushQueue;
use crate::registry::ConnectionRegistry;
use crate::store::{ConfigEvent, ConfigHandler, ConfigSource};

/// Discovery server configuration
#[derive(Debug, Clone)]
pub struct DiscoveryServerConfig {
    /// Control plane identifier sent with every response
    pub server_id: String,
    /// Hold pushes while a response of the same type is unacknowledged
    pub flow_control: bool,
    /// Pushes generated concurrently across all connections
    pub push_concurrency: usize,
    pub debounce: DebounceOptions,
    pub root_namespace: String,
    /// Namespace for proxies whose node id does not carry one
    pub default_namespace: String,
    pub cache_capacity: u64,
    pub ledger_capacity: u64,
}

impl Default for DiscoveryServerConfig {
    fn default() -> Self {
        Self {
            server_id: "meshwire".to_string(),
            flow_control: false,
            push_concurrency: 100,
            debounce: DebounceOptions::default(),
            root_namespace: "mesh-system".to_string(),
            default_namespace: "default".to_string(),
            cache_capacity: 20_000,
            ledger_capacity: 128,
        }
    }
}

/// Outcome of the most recent push fan-out
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushStatus {
    pub version: String,
    pub started_at: Option<DateTime<Utc>>,
    pub full: bool,
    pub reasons: Vec<TriggerReason>,
    pub candidates: usize,
    pub pushed: usize,
    pub pruned: usize,
}

pub struct DiscoveryServer {
    pub(crate) config: DiscoveryServerConfig,
    flow_control: AtomicBool,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) queue: Arc<PushQueue>,
    pub(crate) generators: GeneratorRegistry,
    pub(crate) cache: XdsCache,
    pub(crate) ledger: Ledger,
    source: Arc<dyn ConfigSource>,
    pub(crate) push_context: PushContextHolder,
    /// Last allocated push counter; held while a context is built and swapped
    push_counter: Mutex<u64>,
    semaphore: Arc<Semaphore>,
    updates_tx: mpsc::UnboundedSender<PushRequest>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<PushRequest>>>,
    shutdown_tx: watch::Sender<bool>,
    push_status: RwLock<PushStatus>,
}

impl DiscoveryServer {
    /// Server with the built-in generators
    pub fn new(config: DiscoveryServerConfig, source: Arc<dyn ConfigSource>) -> Arc<Self> {
        Self::with_generators(config, source, GeneratorRegistry::with_builtin)
    }

    /// Server whose generators are built by `generators` around the shared
    /// resource cache
    pub fn with_generators(
        config: DiscoveryServerConfig,
        source: Arc<dyn ConfigSource>,
        generators: impl FnOnce(XdsCache) -> GeneratorRegistry,
    ) -> Arc<Self> {
        let cache = XdsCache::new(config.cache_capacity);
        let ledger = Ledger::new(config.ledger_capacity);
        let initial = PushContext::build(1, source.snapshot(), &config.root_namespace);
        ledger.record(&initial);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            server_id = %config.server_id,
            flow_control = config.flow_control,
            push_concurrency = config.push_concurrency,
            version = %initial.version(),
            "Creating discovery server"
        );

        Arc::new(Self {
            flow_control: AtomicBool::new(config.flow_control),
            registry: ConnectionRegistry::new(),
            queue: Arc::new(PushQueue::new()),
            generators: generators(cache.clone()),
            cache,
            ledger,
            source,
            push_context: PushContextHolder::new(initial),
            push_counter: Mutex::new(1),
            semaphore: Arc::new(Semaphore::new(config.push_concurrency.max(1))),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            shutdown_tx,
            push_status: RwLock::new(PushStatus::default()),
            config,
        })
    }

    pub fn config(&self) -> &DiscoveryServerConfig {
        &self.config
    }

    pub fn flow_control_enabled(&self) -> bool {
        self.flow_control.load(Ordering::Acquire)
    }

    pub fn set_flow_control(&self, enabled: bool) {
        self.flow_control.store(enabled, Ordering::Release);
    }

    pub fn push_context(&self) -> Arc<PushContext> {
        self.push_context.current()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &PushQueue {
        &self.queue
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start the debounce and dispatch tasks. Must run inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let updates = self
            .updates_rx
            .lock()
            .take()
            .ok_or_else(|| XdsError::InvalidConfig("discovery server already started".to_string()))?;

        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(debounce(
            updates,
            self.shutdown_tx.subscribe(),
            self.config.debounce,
            move |request| {
                if let Some(server) = weak.upgrade() {
                    server.push(request);
                }
            },
        ));

        tokio::spawn(self.clone().dispatch(self.shutdown_tx.subscribe()));

        info!(
            debounce = self.config.debounce.enabled,
            debounce_after_ms = self.config.debounce.after.as_millis() as u64,
            "Discovery server started"
        );
        Ok(())
    }

    /// Stop background tasks and close every stream
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.queue.shutdown();
        let connections = self.registry.list();
        info!(connections = connections.len(), "Shutting down discovery server");
        for con in connections {
            con.stop();
        }
    }

    /// Feed a change into the debounce stage
    pub fn config_update(&self, request: PushRequest) {
        metrics::record_config_update(request.full);
        if self.updates_tx.send(request).is_err() {
            warn!("Config update dropped: debounce task has stopped");
        }
    }

    /// Handler for `MemoryConfigStore::register_handler`
    pub fn config_handler(self: &Arc<Self>) -> ConfigHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |event: ConfigEvent| {
            if let Some(server) = weak.upgrade() {
                server.config_update(request_for_event(event));
            }
        })
    }

    /// Build the push context for `request` and fan it out.
    ///
    /// Callers are serialized so contexts are published in counter order and
    /// an endpoint-only update always derives from the latest full build.
    pub fn push(&self, mut request: PushRequest) {
        let mut counter = self.push_counter.lock();
        *counter += 1;
        let next = if request.full {
            PushContext::build(*counter, self.source.snapshot(), &self.config.root_namespace)
        } else {
            self.push_context
                .current()
                .with_endpoints(*counter, self.source.snapshot().endpoints)
        };
        let next = Arc::new(next);
        self.ledger.record(&next);
        self.push_context.swap(next.clone());
        request.push = Some(next);
        self.start_push(request);
    }

    /// Decide who needs `request` and queue it for them
    pub fn start_push(&self, mut request: PushRequest) {
        let push = match &request.push {
            Some(push) => push.clone(),
            None => {
                let push = self.push_context.current();
                request.push = Some(push.clone());
                push
            }
        };

        let candidates: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .filter(|con| {
                request
                    .targets
                    .as_ref()
                    .is_none_or(|targets| targets.contains(con.con_id()))
            })
            .collect();

        let mut pushed = 0;
        let mut pruned = 0;
        for con in &candidates {
            match proxy_needs_push(con, &request, &push) {
                Some(types) => {
                    self.queue.enqueue(con, request.scoped_to(types));
                    pushed += 1;
                }
                None => pruned += 1,
            }
        }

        metrics::record_pruned(pruned);
        metrics::set_queue_size(self.queue.pending());
        info!(
            version = %push.version(),
            full = request.full,
            configs = request.configs_updated.len(),
            candidates = candidates.len(),
            pushed,
            pruned,
            "Push started"
        );

        *self.push_status.write() = PushStatus {
            version: push.version().to_string(),
            started_at: Some(Utc::now()),
            full: request.full,
            reasons: request.reason_labels(),
            candidates: candidates.len(),
            pushed,
            pruned,
        };
    }

    pub fn push_status(&self) -> PushStatus {
        self.push_status.read().clone()
    }

    /// Hand queued pushes to connection tasks, bounded by the semaphore
    async fn dispatch(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            let Some((con, request)) = self.queue.dequeue().await else {
                break;
            };
            metrics::set_queue_size(self.queue.pending());
            debug!(con_id = %con.con_id(), "Dispatching push");

            let event = PushEvent::new(request, self.queue.clone(), con.clone(), Some(permit));
            tokio::spawn(async move { con.deliver(event).await });
        }
        debug!("Push dispatcher stopped");
    }
}

/// Debounce window for tests and tools that want pushes right away
pub fn no_debounce() -> DebounceOptions {
    DebounceOptions {
        enabled: false,
        after: Duration::ZERO,
        max: Duration::ZERO,
        eds: false,
    }
}

fn request_for_event(event: ConfigEvent) -> PushRequest {
    let reason = if event.endpoints_only {
        TriggerReason::EndpointUpdate
    } else if event.key.kind == ConfigKind::ServiceEntry {
        TriggerReason::ServiceUpdate
    } else {
        TriggerReason::ConfigUpdate
    };
    PushRequest::for_configs(!event.endpoints_only, [event.key], reason)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::{Connection, ConnectionMeta};
    use crate::model::{ConfigKey, Proxy};
    use crate::store::MemoryConfigStore;
    use crate::watch::WatchedResource;
    use crate::xds::ResourceType;
    use crate::xds::proto::Node;

    fn server() -> Arc<DiscoveryServer> {
        DiscoveryServer::new(
            DiscoveryServerConfig {
                debounce: no_debounce(),
                ..Default::default()
            },
            Arc::new(MemoryConfigStore::new()),
        )
    }

    fn register(server: &DiscoveryServer, id: &str) -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(1);
        let proxy = Proxy::from_node(
            &Node {
                id: id.to_string(),
                ..Default::default()
            },
            "default",
        )
        .unwrap();
        let con_id = server.registry.next_connection_id(id);
        let (con, _) = Connection::new(con_id, ConnectionMeta::default(), proxy, tx);
        con.with_watches(|w| {
            w.insert(
                ResourceType::Cluster,
                WatchedResource::new(ResourceType::Cluster, vec![]),
            );
        });
        server.registry.register(con.clone());
        con
    }

    #[test]
    fn test_push_advances_version() {
        let server = server();
        let before = server.push_context();
        server.push(PushRequest::full(TriggerReason::GlobalUpdate));
        let after = server.push_context();
        assert_eq!(after.counter(), before.counter() + 1);
        assert_ne!(after.version_prefix(), before.version_prefix());
        assert_eq!(server.ledger.len(), 2);
    }

    #[test]
    fn test_start_push_enqueues_and_reports() {
        let server = server();
        register(&server, "a");
        register(&server, "b");
        server.push(PushRequest::full(TriggerReason::GlobalUpdate));

        let status = server.push_status();
        assert_eq!(status.candidates, 2);
        assert_eq!(status.pushed, 2);
        assert_eq!(server.queue.pending(), 2);
    }

    #[test]
    fn test_concurrent_pushes_publish_in_counter_order() {
        let store = Arc::new(MemoryConfigStore::new());
        let server = DiscoveryServer::new(
            DiscoveryServerConfig {
                debounce: no_debounce(),
                ..Default::default()
            },
            store.clone(),
        );
        store.add_service(crate::mesh::Service {
            hostname: "reviews.bookinfo.svc.cluster.local".to_string(),
            namespace: "bookinfo".to_string(),
            ports: vec![],
        });
        let start = server.push_context().counter();
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            let watcher = s.spawn(|| {
                let mut last = 0;
                let mut regressions = 0;
                while !done.load(Ordering::Acquire) {
                    let counter = server.push_context().counter();
                    if counter < last {
                        regressions += 1;
                    }
                    last = counter;
                }
                regressions
            });
            let workers: Vec<_> = (0..4)
                .map(|i| {
                    let server = &server;
                    s.spawn(move || {
                        for _ in 0..50 {
                            if i % 2 == 0 {
                                server.force_push_all();
                            } else {
                                server.push(PushRequest::for_configs(
                                    false,
                                    std::iter::empty::<ConfigKey>(),
                                    TriggerReason::EndpointUpdate,
                                ));
                            }
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
            done.store(true, Ordering::Release);
            assert_eq!(watcher.join().unwrap(), 0);
        });

        let last = server.push_context();
        assert_eq!(last.counter(), start + 200);
        assert_eq!(
            last.services_for_host("reviews.bookinfo.svc.cluster.local")
                .count(),
            1
        );
    }

    #[test]
    fn test_targeted_push() {
        let server = server();
        let a = register(&server, "a");
        register(&server, "b");
        server.push(
            PushRequest::full(TriggerReason::DebugTrigger).with_targets([a.con_id().to_string()]),
        );
        assert_eq!(server.push_status().candidates, 1);
        assert_eq!(server.queue.pending(), 1);
    }

    #[test]
    fn test_connections_without_watches_are_pruned() {
        let server = server();
        let con = register(&server, "a");
        con.with_watches(|w| w.clear());
        server.push(PushRequest::full(TriggerReason::GlobalUpdate));
        assert_eq!(server.push_status().pruned, 1);
        assert_eq!(server.queue.pending(), 0);
    }

    #[test]
    fn test_flow_control_toggle() {
        let server = server();
        assert!(!server.flow_control_enabled());
        server.set_flow_control(true);
        assert!(server.flow_control_enabled());
    }

    #[test]
    fn test_event_to_request() {
        let key = ConfigKey::new(ConfigKind::ServiceEntry, "a.default", "default");
        let req = request_for_event(ConfigEvent {
            key: key.clone(),
            endpoints_only: true,
        });
        assert!(!req.full);
        assert_eq!(req.reasons, vec![TriggerReason::EndpointUpdate]);

        let req = request_for_event(ConfigEvent {
            key,
            endpoints_only: false,
        });
        assert!(req.full);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = server();
        server.start().unwrap();
        assert!(server.start().is_err());
        server.shutdown();
        assert!(server.is_shutdown());
    }
}
