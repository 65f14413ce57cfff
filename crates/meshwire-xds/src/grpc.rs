//! gRPC surface of the aggregated discovery service
//!
//! Written by hand in the shape tonic's code generator would produce, since
//! the messages are hand-written too. Only the state-of-the-world
//! `StreamAggregatedResources` method is served.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::{Body, BoxFuture, Service, StdError};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::connection::ConnectionMeta;
use crate::error::XdsError;
use crate::server::DiscoveryServer;
use crate::xds::proto::{DiscoveryRequest, DiscoveryResponse};

pub const SERVICE_NAME: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";
const STREAM_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// Metadata key carrying principals verified by a fronting proxy
pub const IDENTITY_HEADER: &str = "x-meshwire-identity";

/// Responses buffered per stream before sends wait on the peer
const RESPONSE_BUFFER: usize = 16;

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

/// Principals established by the transport, inserted as a request extension
#[derive(Debug, Clone, Default)]
pub struct PeerIdentities(pub Vec<String>);

#[tonic::async_trait]
pub trait AggregatedDiscoveryService: Send + Sync + 'static {
    type StreamAggregatedResourcesStream: Stream<Item = Result<DiscoveryResponse, Status>>
        + Send
        + 'static;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status>;
}

/// ADS backed by a [`DiscoveryServer`]
#[derive(Clone)]
pub struct AdsService {
    server: Arc<DiscoveryServer>,
}

impl AdsService {
    pub fn new(server: Arc<DiscoveryServer>) -> Self {
        Self { server }
    }
}

fn connection_meta<T>(request: &Request<T>) -> ConnectionMeta {
    let peer_addr = request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let identities = match request.extensions().get::<PeerIdentities>() {
        Some(PeerIdentities(ids)) => ids.clone(),
        None => request
            .metadata()
            .get(IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };
    ConnectionMeta {
        peer_addr,
        identities,
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsService {
    type StreamAggregatedResourcesStream = ResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        if self.server.is_shutdown() {
            return Err(XdsError::Shutdown.into());
        }
        let meta = connection_meta(&request);
        debug!(peer = %meta.peer_addr, "ADS stream opened");

        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let errors = tx.clone();
        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.stream(meta, inbound, tx).await {
                let _ = errors.send(Err(e.into())).await;
            }
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as ResponseStream
        ))
    }
}

/// tonic service wrapper routing HTTP/2 requests to an
/// [`AggregatedDiscoveryService`]
#[derive(Debug)]
pub struct AggregatedDiscoveryServiceServer<T> {
    inner: Arc<T>,
    max_decoding_message_size: Option<usize>,
    max_encoding_message_size: Option<usize>,
}

impl<T> AggregatedDiscoveryServiceServer<T> {
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self {
            inner,
            max_decoding_message_size: None,
            max_encoding_message_size: None,
        }
    }

    #[must_use]
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.max_decoding_message_size = Some(limit);
        self
    }

    #[must_use]
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
        self.max_encoding_message_size = Some(limit);
        self
    }
}

impl<T> Clone for AggregatedDiscoveryServiceServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            max_decoding_message_size: self.max_decoding_message_size,
            max_encoding_message_size: self.max_encoding_message_size,
        }
    }
}

struct StreamAggregatedResourcesSvc<T>(Arc<T>);

impl<T: AggregatedDiscoveryService> tonic::server::StreamingService<DiscoveryRequest>
    for StreamAggregatedResourcesSvc<T>
{
    type Response = DiscoveryResponse;
    type ResponseStream = T::StreamAggregatedResourcesStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<DiscoveryRequest>>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.stream_aggregated_resources(request).await })
    }
}

impl<T, B> Service<http::Request<B>> for AggregatedDiscoveryServiceServer<T>
where
    T: AggregatedDiscoveryService,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        if req.uri().path() != STREAM_PATH {
            return Box::pin(async move {
                let mut response = http::Response::new(tonic::body::Body::default());
                let headers = response.headers_mut();
                headers.insert(
                    Status::GRPC_STATUS,
                    (tonic::Code::Unimplemented as i32).into(),
                );
                headers.insert(
                    http::header::CONTENT_TYPE,
                    tonic::metadata::GRPC_CONTENT_TYPE,
                );
                Ok(response)
            });
        }

        let inner = self.inner.clone();
        let max_decoding = self.max_decoding_message_size;
        let max_encoding = self.max_encoding_message_size;
        Box::pin(async move {
            let codec = tonic_prost::ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec)
                .apply_max_message_size_config(max_decoding, max_encoding);
            Ok(grpc
                .streaming(StreamAggregatedResourcesSvc(inner), req)
                .await)
        })
    }
}

impl<T> tonic::server::NamedService for AggregatedDiscoveryServiceServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    #[test]
    fn test_identities_from_metadata() {
        let mut request = Request::new(());
        request.metadata_mut().insert(
            IDENTITY_HEADER,
            MetadataValue::from_static("spiffe://cluster.local/ns/a/sa/b, spiffe://x"),
        );
        let meta = connection_meta(&request);
        assert_eq!(
            meta.identities,
            vec!["spiffe://cluster.local/ns/a/sa/b", "spiffe://x"]
        );
        assert!(meta.peer_addr.is_empty());
    }

    #[test]
    fn test_identities_from_extension_win() {
        let mut request = Request::new(());
        request
            .extensions_mut()
            .insert(PeerIdentities(vec!["spiffe://ext".to_string()]));
        request
            .metadata_mut()
            .insert(IDENTITY_HEADER, MetadataValue::from_static("spiffe://header"));
        assert_eq!(connection_meta(&request).identities, vec!["spiffe://ext"]);
    }

    #[test]
    fn test_service_name() {
        use tonic::server::NamedService;
        assert_eq!(
            <AggregatedDiscoveryServiceServer<AdsService> as NamedService>::NAME,
            "envoy.service.discovery.v3.AggregatedDiscoveryService"
        );
    }
}
