// Access guard for the debug surface
// Loopback callers pass; the identity header is honored only from trusted fronting proxies

use std::net::IpAddr;
use std::sync::Arc;

use actix_service::forward_ready;
use actix_utils::future::{Ready, ok};
use actix_web::{
    Error, HttpResponse,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
};
use futures::future::LocalBoxFuture;
use meshwire_xds::grpc::IDENTITY_HEADER;

pub struct LocalOrAuthenticated {
    trusted_proxies: Arc<[IpAddr]>,
}

impl LocalOrAuthenticated {
    /// Guard accepting `IDENTITY_HEADER` from `trusted_proxies` only
    pub fn new(trusted_proxies: Arc<[IpAddr]>) -> Self {
        Self { trusted_proxies }
    }
}

impl<S, B> Transform<S, ServiceRequest> for LocalOrAuthenticated
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = LocalOrAuthenticatedMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(LocalOrAuthenticatedMiddleware {
            service,
            trusted_proxies: self.trusted_proxies.clone(),
        })
    }
}

pub struct LocalOrAuthenticatedMiddleware<S> {
    service: S,
    trusted_proxies: Arc<[IpAddr]>,
}

fn peer_ip(req: &ServiceRequest) -> Option<IpAddr> {
    req.peer_addr().map(|addr| addr.ip().to_canonical())
}

fn has_identity(req: &ServiceRequest) -> bool {
    req.headers()
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|id| !id.trim().is_empty()))
}

impl<S, B> Service<ServiceRequest> for LocalOrAuthenticatedMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let allowed = match peer_ip(&req) {
            Some(ip) if ip.is_loopback() => true,
            Some(ip) => self.trusted_proxies.contains(&ip) && has_identity(&req),
            None => false,
        };
        if !allowed {
            tracing::warn!(
                path = %req.path(),
                peer = ?req.peer_addr(),
                "Rejected unauthenticated debug request"
            );
            let res = req.into_response(HttpResponse::Unauthorized().finish());
            return Box::pin(async move { Ok(res.map_into_right_body()) });
        }

        let res = self.service.call(req);
        Box::pin(async move { res.await.map(ServiceResponse::map_into_left_body) })
    }
}
