//! Per-type watch state and request classification
//!
//! Every inbound request on an ADS stream is one of: an initial subscribe, a
//! resubscribe after reconnect, an ACK, a NACK, a stale request, a change of
//! requested names, or an unsubscribe. Only (nonce, resource names, error
//! detail) are used to tell them apart.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::PushRequest;
use crate::xds::ResourceType;
use crate::xds::proto::DiscoveryRequest;

/// What one connection knows about one resource type
#[derive(Debug, Clone, Serialize)]
pub struct WatchedResource {
    pub resource_type: ResourceType,
    pub resource_names: Vec<String>,
    pub version_sent: String,
    pub nonce_sent: String,
    pub version_acked: String,
    pub nonce_acked: String,
    pub nonce_nacked: String,
    /// Message of the most recent NACK
    pub last_error: Option<String>,
    pub last_sent: Option<DateTime<Utc>>,
    /// Push held back while a response is outstanding
    #[serde(skip)]
    pub blocked: Option<PushRequest>,
}

impl WatchedResource {
    pub fn new(resource_type: ResourceType, resource_names: Vec<String>) -> Self {
        Self {
            resource_type,
            resource_names,
            version_sent: String::new(),
            nonce_sent: String::new(),
            version_acked: String::new(),
            nonce_acked: String::new(),
            nonce_nacked: String::new(),
            last_error: None,
            last_sent: None,
            blocked: None,
        }
    }

    /// A response is outstanding: sent but neither ACKed nor NACKed
    pub fn is_pending(&self) -> bool {
        !self.nonce_sent.is_empty()
            && self.nonce_sent != self.nonce_acked
            && self.nonce_sent != self.nonce_nacked
    }

    pub fn record_sent(&mut self, nonce: &str, version: &str) {
        self.nonce_sent = nonce.to_string();
        self.version_sent = version.to_string();
        self.last_sent = Some(Utc::now());
    }

    /// Hold a push until the outstanding response is answered. Later pushes
    /// fold into the held one so at most one is sent on release.
    pub fn block(&mut self, request: PushRequest) {
        self.blocked = Some(match self.blocked.take() {
            Some(existing) => existing.merge(request),
            None => request,
        });
    }

    pub fn take_blocked(&mut self) -> Option<PushRequest> {
        self.blocked.take()
    }

    pub fn has_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

/// Outcome of classifying one inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// First request for this type on the stream
    Subscribe,
    /// Nonce from a previous stream; state is rebuilt from the request
    Reconnect,
    /// Requested names changed; acked state updated if the nonce matched
    ResourceChange,
    Ack,
    Nack { message: String },
    /// Nonce does not match the last response and names are unchanged
    Stale,
    Unsubscribe,
}

impl RequestKind {
    pub fn should_respond(&self) -> bool {
        matches!(
            self,
            RequestKind::Subscribe | RequestKind::Reconnect | RequestKind::ResourceChange
        )
    }

    /// ACKs and NACKs of the outstanding nonce release a held push
    pub fn releases_blocked(&self) -> bool {
        matches!(self, RequestKind::Ack | RequestKind::Nack { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Subscribe => "INIT",
            RequestKind::Reconnect => "RECONNECT",
            RequestKind::ResourceChange => "RESOURCE CHANGE",
            RequestKind::Ack => "ACK",
            RequestKind::Nack { .. } => "NACK",
            RequestKind::Stale => "EXPIRED NONCE",
            RequestKind::Unsubscribe => "UNSUBSCRIBE",
        }
    }
}

fn same_names(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<&String> = a.iter().collect();
    let b: BTreeSet<&String> = b.iter().collect();
    a == b
}

/// Classify `request` against the watches of one connection and apply the
/// resulting state transition.
pub fn classify(
    watches: &mut HashMap<ResourceType, WatchedResource>,
    resource_type: ResourceType,
    request: &DiscoveryRequest,
) -> RequestKind {
    let nonce = request.response_nonce.as_str();

    if let Some(detail) = &request.error_detail {
        let message = detail.message.clone();
        return match watches.get_mut(&resource_type) {
            Some(w) if !nonce.is_empty() && w.nonce_sent == nonce => {
                w.nonce_nacked = nonce.to_string();
                w.last_error = Some(message.clone());
                RequestKind::Nack { message }
            }
            Some(w) => {
                w.last_error = Some(message);
                RequestKind::Stale
            }
            None => RequestKind::Stale,
        };
    }

    if request.resource_names.is_empty() && !resource_type.is_wildcard() {
        watches.remove(&resource_type);
        return RequestKind::Unsubscribe;
    }

    if nonce.is_empty() {
        watches.insert(
            resource_type,
            WatchedResource::new(resource_type, request.resource_names.clone()),
        );
        return RequestKind::Subscribe;
    }

    let Some(w) = watches.get_mut(&resource_type) else {
        watches.insert(
            resource_type,
            WatchedResource::new(resource_type, request.resource_names.clone()),
        );
        return RequestKind::Reconnect;
    };

    let names_changed = !same_names(&w.resource_names, &request.resource_names);

    if w.nonce_sent != nonce {
        if names_changed {
            w.resource_names = request.resource_names.clone();
            return RequestKind::ResourceChange;
        }
        return RequestKind::Stale;
    }

    w.version_acked = request.version_info.clone();
    w.nonce_acked = nonce.to_string();
    if names_changed {
        w.resource_names = request.resource_names.clone();
        return RequestKind::ResourceChange;
    }
    RequestKind::Ack
}
