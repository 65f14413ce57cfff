//! Push queue
//!
//! Holds at most one pending request per connection in FIFO order. Requests
//! for a connection that is already queued are merged into the queued one;
//! requests for a connection currently being pushed are parked and re-queued
//! when that push completes, so a connection never has two pushes in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::connection::Connection;
use crate::model::PushRequest;

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    pending: HashMap<String, (Arc<Connection>, PushRequest)>,
    /// Connections being pushed, with anything that arrived meanwhile
    processing: HashMap<String, Option<PushRequest>>,
    shutdown: bool,
}

#[derive(Default)]
pub struct PushQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PushQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, con: &Arc<Connection>, request: PushRequest) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        let id = con.con_id();

        if let Some(parked) = state.processing.get_mut(id) {
            *parked = Some(match parked.take() {
                Some(existing) => existing.merge(request),
                None => request,
            });
            return;
        }

        if let Some((_, existing)) = state.pending.get_mut(id) {
            let merged = std::mem::replace(existing, PushRequest::proxy_request());
            *existing = merged.merge(request);
            return;
        }

        state.pending.insert(id.to_string(), (con.clone(), request));
        state.order.push_back(id.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next connection to push. Returns `None` after shutdown.
    pub async fn dequeue(&self) -> Option<(Arc<Connection>, PushRequest)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.shutdown {
                    return None;
                }
                while let Some(id) = state.order.pop_front() {
                    if let Some((con, request)) = state.pending.remove(&id) {
                        state.processing.insert(id, None);
                        return Some((con, request));
                    }
                }
            }
            notified.await;
        }
    }

    /// Finish the push for `con`; anything parked meanwhile is queued again
    pub fn mark_done(&self, con: &Arc<Connection>) {
        let parked = {
            let mut state = self.state.lock();
            match state.processing.remove(con.con_id()) {
                Some(parked) => parked,
                None => return,
            }
        };
        if let Some(request) = parked {
            self.enqueue(con, request);
        }
    }

    /// Drop everything queued or parked for a connection
    pub fn remove(&self, con_id: &str) {
        let mut state = self.state.lock();
        state.pending.remove(con_id);
        state.processing.remove(con_id);
        state.order.retain(|id| id != con_id);
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Connections waiting to be pushed
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_progress(&self) -> usize {
        self.state.lock().processing.len()
    }
}
