//! Tenant resolution middleware.
//!
//! Every non-public request goes through the resolver exactly once; the
//! resulting `RequestContext` rides in request extensions so handlers
//! are already tenant-scoped. Public paths (health probes, login,
//! refresh) skip resolution.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use voxgate_auth::ResolveInput;

use crate::state::AppState;
use crate::ApiError;

/// Paths served without tenant resolution. The streaming channel
/// authenticates inside the upgrade handler (token travels as a query
/// parameter, not a header).
fn is_public_path(path: &str) -> bool {
    matches!(path, "/health" | "/ready" | "/metrics")
        || path.starts_with("/api/v1/auth/login")
        || path.starts_with("/api/v1/auth/refresh")
        || path.starts_with("/ws/voice")
}

pub async fn tenant_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    if is_public_path(&path) {
        return Ok(next.run(request).await);
    }

    let input = resolve_input_from(&request, path);
    let ctx = state.resolver.resolve(&input).await?;

    let mut request = request;
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

fn resolve_input_from(request: &Request, path: String) -> ResolveInput {
    let headers = request.headers();

    let bearer_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from);
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let tenant_header = headers
        .get("x-tenant-slug")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    ResolveInput {
        bearer_token,
        api_key,
        host,
        tenant_header,
        path,
        source_addr: source_addr(request),
    }
}

/// Prefer the forwarded client address, fall back to the socket peer.
fn source_addr(request: &Request) -> Option<IpAddr> {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(addr) = first.trim().parse() {
                return Some(addr);
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}
