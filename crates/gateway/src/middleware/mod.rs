//! The request middleware chain.
//!
//! Order is fixed: API selection binds the `ApiConfig` and a fresh
//! `RequestContext`, jwt auth binds the session, limits enforces rate and
//! quota. Each layer communicates with the next only through the request
//! extensions.

pub mod jwt_auth;
pub mod limits;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ApiConfig;
use crate::context::RequestContext;
use crate::state::GatewayState;

/// Match the request path to an API and seed the per-request context.
pub async fn select_api(
    State(state): State<Arc<GatewayState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(api) = state.match_api(request.uri().path()) else {
        return (StatusCode::NOT_FOUND, "No API matches the request path").into_response();
    };
    request.extensions_mut().insert(api);
    request.extensions_mut().insert(RequestContext::new());
    next.run(request).await
}

/// The API bound by `select_api`. `None` only if the chain is miswired.
pub(crate) fn bound_api(request: &Request) -> Option<Arc<ApiConfig>> {
    request.extensions().get::<Arc<ApiConfig>>().cloned()
}

pub(crate) fn bound_context(request: &Request) -> Option<RequestContext> {
    request.extensions().get::<RequestContext>().cloned()
}

pub(crate) fn chain_miswired(which: &'static str) -> Response {
    tracing::error!(missing = which, "middleware chain is miswired");
    (StatusCode::INTERNAL_SERVER_ERROR, "Gateway misconfigured").into_response()
}

/// Best available client origin: `X-Forwarded-For` first hop, else the
/// socket peer address.
pub(crate) fn request_origin(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "-".to_string())
}
