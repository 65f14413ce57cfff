//! Aggregated discovery stream handling
//!
//! One task per stream reads requests, runs them through the ACK/NACK state
//! machine and applies pushes handed over by the dispatcher. Everything that
//! touches a connection's watches happens on this task, so responses of one
//! type are never reordered past the proxy's own ACKs.

use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionChannels, ConnectionMeta, PushEvent, ResponseSender};
use crate::context::{PushContext, next_nonce};
use crate::error::{Result, XdsError};
use crate::generator::ResourceData;
use crate::metrics;
use crate::model::{Proxy, PushRequest, TriggerReason};
use crate::scope::SidecarScope;
use crate::server::DiscoveryServer;
use crate::watch::{RequestKind, classify};
use crate::xds::ResourceType;
use crate::xds::proto::{ControlPlane, DiscoveryRequest, DiscoveryResponse};

/// A send abandoned because the connection was stopped is a clean close
fn stopped_ok(con: &Connection, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if con.is_stopped() => {
            debug!(con_id = %con.con_id(), error = %e, "Send abandoned on stop");
            Ok(())
        }
        other => other,
    }
}

impl DiscoveryServer {
    /// Serve one ADS stream until the peer goes away, the connection is
    /// stopped or a response can no longer be sent.
    pub async fn stream<S>(
        self: Arc<Self>,
        meta: ConnectionMeta,
        mut inbound: S,
        outbound: ResponseSender,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<DiscoveryRequest, Status>> + Unpin + Send,
    {
        if self.is_shutdown() {
            return Err(XdsError::Shutdown);
        }

        let first = match inbound.next().await {
            Some(Ok(request)) => request,
            Some(Err(status)) => {
                return Err(XdsError::Transport(status.message().to_string()));
            }
            None => return Ok(()),
        };
        let node = first
            .node
            .as_ref()
            .ok_or_else(|| XdsError::Protocol("first request must carry a node".to_string()))?;

        let mut proxy = Proxy::from_node(node, &self.config.default_namespace)?;
        let push = self.push_context.current();
        proxy.sidecar_scope = Some(Arc::new(SidecarScope::compute(&push, &proxy.namespace)));

        let con_id = self.registry.next_connection_id(&proxy.id);
        let (con, channels) = Connection::new(con_id, meta, proxy, outbound);
        self.registry.register(con.clone());

        let result = self.run(&con, first, inbound, channels).await;

        self.registry.unregister(con.con_id());
        self.queue.remove(con.con_id());
        match &result {
            Ok(()) => info!(con_id = %con.con_id(), "ADS stream closed"),
            Err(e) => warn!(con_id = %con.con_id(), error = %e, "ADS stream terminated"),
        }
        result
    }

    async fn run<S>(
        &self,
        con: &Arc<Connection>,
        first: DiscoveryRequest,
        mut inbound: S,
        mut channels: ConnectionChannels,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<DiscoveryRequest, Status>> + Unpin + Send,
    {
        stopped_ok(con, self.process_request(con, first).await)?;

        loop {
            tokio::select! {
                biased;

                _ = channels.stop_rx.changed() => {
                    info!(con_id = %con.con_id(), "ADS stream stopped by server");
                    return Ok(());
                }
                request = inbound.next() => match request {
                    Some(Ok(request)) => stopped_ok(con, self.process_request(con, request).await)?,
                    Some(Err(status)) => {
                        debug!(con_id = %con.con_id(), code = ?status.code(), "ADS stream receive failed");
                        return Ok(());
                    }
                    None => return Ok(()),
                },
                Some(event) = channels.push_rx.recv() => {
                    stopped_ok(con, self.push_connection(con, event).await)?;
                }
            }
            if con.is_stopped() {
                info!(con_id = %con.con_id(), "ADS stream stopped by server");
                return Ok(());
            }
        }
    }

    async fn process_request(&self, con: &Connection, request: DiscoveryRequest) -> Result<()> {
        let Some(resource_type) = ResourceType::from_type_url(&request.type_url) else {
            warn!(con_id = %con.con_id(), type_url = %request.type_url, "Unknown resource type");
            return Ok(());
        };
        if !self.generators.contains(resource_type) {
            warn!(con_id = %con.con_id(), type_url = %request.type_url, "No generator registered");
            return Ok(());
        }

        let kind = con.with_watches(|watches| classify(watches, resource_type, &request));
        match &kind {
            RequestKind::Nack { message } => {
                metrics::record_reject(resource_type);
                warn!(
                    con_id = %con.con_id(),
                    type_url = %request.type_url,
                    nonce = %request.response_nonce,
                    version = %request.version_info,
                    error = %message,
                    "NACK"
                );
            }
            RequestKind::Stale => {
                metrics::record_expired_nonce(resource_type);
                debug!(
                    con_id = %con.con_id(),
                    type_url = %request.type_url,
                    nonce = %request.response_nonce,
                    "EXPIRED NONCE"
                );
            }
            other => debug!(
                con_id = %con.con_id(),
                type_url = %request.type_url,
                nonce = %request.response_nonce,
                resources = request.resource_names.len(),
                "{}",
                other.label()
            ),
        }

        if kind.should_respond() {
            // the response carries the latest state; anything held is covered
            con.take_blocked(resource_type);
            let push = self.push_context.current();
            return self
                .push_xds(con, resource_type, &PushRequest::proxy_request(), &push)
                .await;
        }

        if kind.releases_blocked()
            && let Some(blocked) = con.take_blocked(resource_type)
        {
            debug!(con_id = %con.con_id(), type_url = %request.type_url, "Releasing held push");
            let push = self.push_context.current();
            return self.push_xds(con, resource_type, &blocked, &push).await;
        }
        Ok(())
    }

    async fn push_connection(&self, con: &Connection, event: PushEvent) -> Result<()> {
        let request = &event.request;
        let push = self.push_context.current();
        let flow_control = self.flow_control_enabled();

        for resource_type in ResourceType::ALL {
            if request
                .resource_types
                .as_ref()
                .is_some_and(|types| !types.contains(&resource_type))
            {
                continue;
            }
            if con.watched(resource_type).is_none() {
                continue;
            }
            if flow_control && con.is_pending(resource_type) {
                debug!(
                    con_id = %con.con_id(),
                    type_url = %resource_type.type_url(),
                    "Push held until the outstanding response is acknowledged"
                );
                metrics::record_delayed_push(resource_type);
                con.block(resource_type, request.clone());
                continue;
            }
            self.push_xds(con, resource_type, request, &push).await?;
        }
        Ok(())
    }

    /// Generate and send one response. Generation failures are logged and
    /// leave the connection open; send failures end the stream.
    async fn push_xds(
        &self,
        con: &Connection,
        resource_type: ResourceType,
        request: &PushRequest,
        push: &PushContext,
    ) -> Result<()> {
        let Some(watched) = con.watched(resource_type) else {
            return Ok(());
        };
        let proxy = con.proxy();
        let started = Instant::now();

        let resources = match self
            .generators
            .generate(resource_type, &proxy, push, &watched, request)
        {
            Ok(Some(resources)) => resources,
            Ok(None) => {
                debug!(con_id = %con.con_id(), type_url = %resource_type.type_url(), "Nothing to push");
                return Ok(());
            }
            Err(e) => {
                metrics::record_push_error(resource_type, "generation");
                warn!(
                    con_id = %con.con_id(),
                    type_url = %resource_type.type_url(),
                    error = %e,
                    "Failed to generate resources"
                );
                return Ok(());
            }
        };

        let version = push.version().to_string();
        let nonce = next_nonce(&version);
        let count = resources.len();
        let resources: Vec<_> = resources.into_iter().map(ResourceData::into_any).collect();
        let bytes: usize = resources.iter().map(|r| r.value.len()).sum();
        let response = DiscoveryResponse {
            version_info: version.clone(),
            resources,
            canary: false,
            type_url: resource_type.type_url().to_string(),
            nonce: nonce.clone(),
            control_plane: Some(ControlPlane {
                identifier: self.config.server_id.clone(),
            }),
        };

        if let Err(e) = con.send(response).await {
            metrics::record_push_error(resource_type, "send");
            return Err(e);
        }
        con.record_sent(resource_type, &nonce, &version);

        metrics::record_push(resource_type, started.elapsed(), bytes);
        if !request.reasons.contains(&TriggerReason::ProxyRequest) {
            metrics::record_convergence(request.start.elapsed());
        }
        if let Some(elapsed) = con.mark_first_push() {
            debug!(con_id = %con.con_id(), elapsed_ms = elapsed.as_millis() as u64, "First push");
        }
        debug!(
            con_id = %con.con_id(),
            type_url = %resource_type.type_url(),
            resources = count,
            size = bytes,
            version = %version,
            nonce = %nonce,
            "PUSH"
        );
        Ok(())
    }
}
