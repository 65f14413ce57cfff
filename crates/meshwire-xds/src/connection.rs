//! A proxy's ADS session

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, mpsc, watch};
use tonic::Status;

use crate::error::{Result, XdsError};
use crate::model::{Proxy, PushRequest};
use crate::queue::PushQueue;
use crate::scope::SidecarScope;
use crate::watch::WatchedResource;
use crate::xds::proto::DiscoveryResponse;
use crate::xds::{ResourceType, TypeSet};

pub type ResponseSender = mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>;

/// Transport facts about a stream, captured before the first request
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub peer_addr: String,
    /// Principals established by the transport layer
    pub identities: Vec<String>,
}

/// Push handed to a connection task by the dispatcher. Dropping it marks the
/// connection done in the queue and frees the worker permit.
pub struct PushEvent {
    pub request: PushRequest,
    _done: PushDone,
}

struct PushDone {
    queue: Arc<PushQueue>,
    con: Arc<Connection>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for PushDone {
    fn drop(&mut self) {
        self.queue.mark_done(&self.con);
    }
}

impl PushEvent {
    pub(crate) fn new(
        request: PushRequest,
        queue: Arc<PushQueue>,
        con: Arc<Connection>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            request,
            _done: PushDone {
                queue,
                con,
                _permit: permit,
            },
        }
    }
}

pub struct Connection {
    con_id: String,
    meta: ConnectionMeta,
    connected_at: DateTime<Utc>,
    proxy: RwLock<Arc<Proxy>>,
    watches: RwLock<HashMap<ResourceType, WatchedResource>>,
    outbound: ResponseSender,
    push_tx: mpsc::Sender<PushEvent>,
    stop_tx: watch::Sender<bool>,
    first_pushed: AtomicBool,
}

/// Receiving halves owned by the connection task
pub struct ConnectionChannels {
    pub push_rx: mpsc::Receiver<PushEvent>,
    pub stop_rx: watch::Receiver<bool>,
}

impl Connection {
    pub fn new(
        con_id: String,
        meta: ConnectionMeta,
        proxy: Proxy,
        outbound: ResponseSender,
    ) -> (Arc<Connection>, ConnectionChannels) {
        // The queue never has more than one event in flight per connection.
        let (push_tx, push_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let con = Arc::new(Connection {
            con_id,
            meta,
            connected_at: Utc::now(),
            proxy: RwLock::new(Arc::new(proxy)),
            watches: RwLock::new(HashMap::new()),
            outbound,
            push_tx,
            stop_tx,
            first_pushed: AtomicBool::new(false),
        });
        (con, ConnectionChannels { push_rx, stop_rx })
    }

    pub fn con_id(&self) -> &str {
        &self.con_id
    }

    pub fn peer_addr(&self) -> &str {
        &self.meta.peer_addr
    }

    pub fn identities(&self) -> &[String] {
        &self.meta.identities
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn proxy(&self) -> Arc<Proxy> {
        self.proxy.read().clone()
    }

    pub fn proxy_id(&self) -> String {
        self.proxy.read().id.clone()
    }

    /// Recompute the sidecar scope, keeping the current one as previous
    pub fn update_scope(&self, scope: Arc<SidecarScope>) {
        let mut proxy = self.proxy.write();
        *proxy = Arc::new(proxy.with_scope(scope));
    }

    pub fn scopes(&self) -> (Option<Arc<SidecarScope>>, Option<Arc<SidecarScope>>) {
        let proxy = self.proxy.read();
        (
            proxy.sidecar_scope.clone(),
            proxy.prev_sidecar_scope.clone(),
        )
    }

    /// Run `f` with exclusive access to the watch map
    pub fn with_watches<R>(
        &self,
        f: impl FnOnce(&mut HashMap<ResourceType, WatchedResource>) -> R,
    ) -> R {
        f(&mut self.watches.write())
    }

    pub fn watched(&self, t: ResourceType) -> Option<WatchedResource> {
        self.watches.read().get(&t).cloned()
    }

    pub fn watched_types(&self) -> TypeSet {
        self.watches.read().keys().copied().collect()
    }

    pub fn watches_snapshot(&self) -> Vec<WatchedResource> {
        let mut out: Vec<_> = self.watches.read().values().cloned().collect();
        out.sort_by_key(|w| w.resource_type);
        out
    }

    pub fn is_pending(&self, t: ResourceType) -> bool {
        self.watches
            .read()
            .get(&t)
            .is_some_and(WatchedResource::is_pending)
    }

    pub fn record_sent(&self, t: ResourceType, nonce: &str, version: &str) {
        if let Some(w) = self.watches.write().get_mut(&t) {
            w.record_sent(nonce, version);
        }
    }

    /// Hold `request` for type `t` until the outstanding response clears
    pub fn block(&self, t: ResourceType, request: PushRequest) {
        if let Some(w) = self.watches.write().get_mut(&t) {
            w.block(request);
        }
    }

    pub fn take_blocked(&self, t: ResourceType) -> Option<PushRequest> {
        self.watches
            .write()
            .get_mut(&t)
            .and_then(WatchedResource::take_blocked)
    }

    /// Send a response on the stream. Fails once the peer has gone away or
    /// the connection is stopped while the peer is not reading.
    pub async fn send(&self, response: DiscoveryResponse) -> Result<()> {
        tokio::select! {
            sent = self.outbound.send(Ok(response)) => sent
                .map_err(|_| XdsError::Transport(format!("stream {} closed", self.con_id))),
            _ = self.stopped() => Err(XdsError::Transport(format!("stream {} stopped", self.con_id))),
        }
    }

    /// Hand a push to the connection task. A closed connection drops the event.
    pub(crate) async fn deliver(&self, event: PushEvent) {
        tokio::select! {
            _ = self.push_tx.send(event) => {}
            _ = self.stopped() => {}
        }
    }

    async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Ask the connection task to close the stream
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Time from connect to the first response, reported once
    pub(crate) fn mark_first_push(&self) -> Option<std::time::Duration> {
        if self.first_pushed.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some((Utc::now() - self.connected_at).to_std().unwrap_or_default())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("con_id", &self.con_id)
            .field("peer_addr", &self.meta.peer_addr)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggerReason;
    use crate::xds::proto::Node;

    fn connection() -> (Arc<Connection>, ConnectionChannels, mpsc::Receiver<std::result::Result<DiscoveryResponse, Status>>) {
        let (tx, rx) = mpsc::channel(4);
        let proxy = Proxy::from_node(
            &Node {
                id: "sidecar~10.0.0.1~app.default~default.svc.cluster.local".to_string(),
                ..Default::default()
            },
            "default",
        )
        .unwrap();
        let (con, channels) = Connection::new(
            "sidecar~10.0.0.1~app.default~default.svc.cluster.local-1".to_string(),
            ConnectionMeta {
                peer_addr: "10.0.0.1:5000".to_string(),
                identities: vec![],
            },
            proxy,
            tx,
        );
        (con, channels, rx)
    }

    #[test]
    fn test_block_requires_watch() {
        let (con, _channels, _rx) = connection();
        con.block(ResourceType::Cluster, PushRequest::full(TriggerReason::ConfigUpdate));
        assert!(con.take_blocked(ResourceType::Cluster).is_none());

        con.with_watches(|w| {
            w.insert(ResourceType::Cluster, WatchedResource::new(ResourceType::Cluster, vec![]));
        });
        con.block(ResourceType::Cluster, PushRequest::full(TriggerReason::ConfigUpdate));
        assert!(con.take_blocked(ResourceType::Cluster).is_some());
    }

    #[test]
    fn test_pending_tracking() {
        let (con, _channels, _rx) = connection();
        con.with_watches(|w| {
            w.insert(ResourceType::Cluster, WatchedResource::new(ResourceType::Cluster, vec![]));
        });
        assert!(!con.is_pending(ResourceType::Cluster));
        con.record_sent(ResourceType::Cluster, "n1", "v1");
        assert!(con.is_pending(ResourceType::Cluster));
        assert_eq!(con.watched_types().len(), 1);
    }

    #[tokio::test]
    async fn test_send_fails_after_peer_drops() {
        let (con, _channels, rx) = connection();
        con.send(DiscoveryResponse::default()).await.unwrap();
        drop(rx);
        assert!(con.send(DiscoveryResponse::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let (con, mut channels, _rx) = connection();
        assert!(!con.is_stopped());
        con.stop();
        assert!(con.is_stopped());
        channels.stop_rx.changed().await.unwrap();
        assert!(*channels.stop_rx.borrow());
    }

    #[test]
    fn test_scope_rotation() {
        let (con, _channels, _rx) = connection();
        let push = crate::context::PushContext::empty("mesh-system");
        con.update_scope(Arc::new(SidecarScope::compute(&push, "default")));
        let (current, prev) = con.scopes();
        assert!(current.is_some());
        assert!(prev.is_none());
        con.update_scope(Arc::new(SidecarScope::compute(&push, "default")));
        let (_, prev) = con.scopes();
        assert!(prev.is_some());
    }
}
