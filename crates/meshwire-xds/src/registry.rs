//! Registry of live ADS connections

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::info;

use crate::connection::Connection;
use crate::metrics;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    /// Source of connection id suffixes
    next_id: AtomicU64,
    total_registered: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unique id for a new stream from `proxy_id`
    pub fn next_connection_id(&self, proxy_id: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", proxy_id, n)
    }

    pub fn register(&self, con: Arc<Connection>) {
        self.connections.insert(con.con_id().to_string(), con.clone());
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        metrics::set_connected_clients(self.connections.len());
        info!(
            con_id = %con.con_id(),
            peer = %con.peer_addr(),
            connected = self.connections.len(),
            "ADS connection registered"
        );
    }

    pub fn unregister(&self, con_id: &str) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(con_id).map(|(_, con)| con);
        if removed.is_some() {
            metrics::set_connected_clients(self.connections.len());
            info!(
                con_id = %con_id,
                connected = self.connections.len(),
                "ADS connection unregistered"
            );
        }
        removed
    }

    pub fn get(&self, con_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(con_id).map(|e| e.value().clone())
    }

    /// Snapshot of the live connections, ordered by id
    pub fn list(&self) -> Vec<Arc<Connection>> {
        let mut out: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.con_id().cmp(b.con_id()));
        out
    }

    pub fn find(&self, predicate: impl Fn(&Connection) -> bool) -> Option<Arc<Connection>> {
        self.list().into_iter().find(|con| predicate(con))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections registered since start, including closed ones
    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }
}
