use actix_web::{HttpResponse, Responder, http::StatusCode, web};
use meshwire_xds::XdsError;
use meshwire_xds::debug::AdsClients;
use serde::Deserialize;

use super::{DebugState, endpoints};

const MISSING_PROXY_ID: &str = "You must provide a proxyID in the query string\n";
const PROXY_NOT_CONNECTED: &str =
    "Proxy not connected to this Meshwire instance. It may be connected to another instance.\n";
const MISSING_RESOURCE: &str = "querystring parameter 'resource' is required\n";

#[derive(Debug, Default, Deserialize)]
pub struct DebugQuery {
    #[serde(rename = "proxyID")]
    proxy_id: Option<String>,
    push: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DistributionQuery {
    resource: Option<String>,
    proxy_namespace: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn text(status: StatusCode, body: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status)
        .content_type("text/plain; charset=utf-8")
        .body(body.into())
}

/// Answer `?push=...` with a full push, as adsz and edsz do
fn handle_push_request(state: &DebugState, query: &DebugQuery) -> Option<HttpResponse> {
    non_empty(&query.push)?;
    let count = state.server.force_push_all();
    Some(text(StatusCode::OK, format!("Pushed to {} servers\n", count)))
}

fn require_proxy_id(query: &DebugQuery) -> Result<&str, HttpResponse> {
    non_empty(&query.proxy_id).ok_or_else(|| text(StatusCode::BAD_REQUEST, MISSING_PROXY_ID))
}

fn lookup_error(err: XdsError) -> HttpResponse {
    match err {
        XdsError::ConnectionNotFound(_) => text(StatusCode::NOT_FOUND, PROXY_NOT_CONNECTED),
        other => text(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

pub async fn index(state: web::Data<DebugState>) -> impl Responder {
    let mut body = String::from(
        "<html><head><title>Meshwire debug</title></head><body>\n<table>\n\
         <tr><th>Name</th><th>Description</th></tr>\n",
    );
    for (path, help) in endpoints(state.unsafe_endpoints) {
        body.push_str(&format!(
            "<tr><td><a href=\"{path}\">{path}</a></td><td>{help}</td></tr>\n"
        ));
    }
    body.push_str("</table>\n</body></html>\n");
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(body)
}

/// Command names without the `/debug/` prefix, excluding `list` itself
pub async fn list(state: web::Data<DebugState>) -> impl Responder {
    let names: Vec<String> = endpoints(state.unsafe_endpoints)
        .into_iter()
        .map(|(path, _)| path.trim_start_matches("/debug/").to_string())
        .filter(|name| name != "list")
        .collect();
    HttpResponse::Ok().json(names)
}

pub async fn adsz(state: web::Data<DebugState>, query: web::Query<DebugQuery>) -> HttpResponse {
    if let Some(res) = handle_push_request(&state, &query) {
        return res;
    }
    HttpResponse::Ok().json(state.server.ads_clients())
}

pub async fn connections(state: web::Data<DebugState>) -> impl Responder {
    let clients = state.server.connections();
    HttpResponse::Ok().json(AdsClients {
        total_clients: clients.len(),
        clients,
    })
}

pub async fn syncz(state: web::Data<DebugState>) -> impl Responder {
    HttpResponse::Ok().json(state.server.sync_status())
}

pub async fn config_distribution(
    state: web::Data<DebugState>,
    query: web::Query<DistributionQuery>,
) -> HttpResponse {
    let Some(resource) = non_empty(&query.resource) else {
        return text(StatusCode::UNPROCESSABLE_ENTITY, MISSING_RESOURCE);
    };
    let versions = state
        .server
        .distributed_versions(resource, non_empty(&query.proxy_namespace));
    HttpResponse::Ok().json(versions)
}

pub async fn cachez(state: web::Data<DebugState>) -> impl Responder {
    let mut keys = state.server.cache_keys();
    keys.sort();
    HttpResponse::Ok().json(keys)
}

pub async fn resourcesz(state: web::Data<DebugState>) -> impl Responder {
    HttpResponse::Ok().json(state.server.resources())
}

pub async fn sidecarz(state: web::Data<DebugState>, query: web::Query<DebugQuery>) -> HttpResponse {
    let proxy_id = match require_proxy_id(&query) {
        Ok(id) => id,
        Err(res) => return res,
    };
    match state.server.sidecar_scope(proxy_id) {
        Ok(scope) => HttpResponse::Ok().json(scope.as_ref()),
        Err(e) => lookup_error(e),
    }
}

pub async fn edsz(state: web::Data<DebugState>, query: web::Query<DebugQuery>) -> HttpResponse {
    if let Some(res) = handle_push_request(&state, &query) {
        return res;
    }
    let proxy_id = match require_proxy_id(&query) {
        Ok(id) => id,
        Err(res) => return res,
    };
    match state.server.endpoints(proxy_id) {
        Ok(assignments) => HttpResponse::Ok().json(assignments),
        Err(e) => lookup_error(e),
    }
}

pub async fn configz(state: web::Data<DebugState>) -> impl Responder {
    HttpResponse::Ok().json(state.server.config_dump())
}

pub async fn push_status(state: web::Data<DebugState>) -> impl Responder {
    HttpResponse::Ok().json(state.server.push_status())
}

pub async fn force_disconnect(
    state: web::Data<DebugState>,
    query: web::Query<DebugQuery>,
) -> HttpResponse {
    let proxy_id = match require_proxy_id(&query) {
        Ok(id) => id,
        Err(res) => return res,
    };
    match state.server.force_disconnect(proxy_id) {
        Ok(()) => text(StatusCode::OK, "OK"),
        Err(e) => lookup_error(e),
    }
}

pub async fn metrics(state: web::Data<DebugState>) -> HttpResponse {
    match &state.prometheus {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => text(StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed\n"),
    }
}
