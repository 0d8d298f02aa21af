//! Upstream dispatch.
//!
//! The proxy layer proper lives outside this crate; what the middleware
//! chain needs is an interface to hand the authenticated request to. The
//! bundled implementation is a deliberately thin reqwest passthrough with
//! no response transformation.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::config::ApiConfig;

const MAX_PROXY_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Hop-by-hop headers that must not be forwarded.
const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

#[async_trait]
pub trait UpstreamDispatcher: Send + Sync {
    /// Forward an authenticated request to the API's upstream and return
    /// the response verbatim.
    async fn dispatch(&self, api: &ApiConfig, request: Request<Body>) -> Response;
}

pub struct HttpUpstream {
    http: reqwest::Client,
}

impl HttpUpstream {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn target_url(api: &ApiConfig, path: &str, query: Option<&str>) -> String {
        let stripped = path.strip_prefix(api.listen_path.as_str()).unwrap_or(path);
        let base = api.upstream_url.trim_end_matches('/');
        let mut url = format!("{base}/{}", stripped.trim_start_matches('/'));
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

#[async_trait]
impl UpstreamDispatcher for HttpUpstream {
    async fn dispatch(&self, api: &ApiConfig, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let url = Self::target_url(api, parts.uri.path(), parts.uri.query());

        let body = match axum::body::to_bytes(body, MAX_PROXY_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to buffer request body");
                return (StatusCode::BAD_GATEWAY, "Upstream dispatch failed").into_response();
            }
        };

        let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return (StatusCode::BAD_GATEWAY, "Upstream dispatch failed").into_response();
            }
        };

        let mut outbound = self.http.request(method, &url);
        for (name, value) in &parts.headers {
            let lowered = name.as_str().to_ascii_lowercase();
            if lowered == "host" || HOP_BY_HOP.contains(&lowered.as_str()) {
                continue;
            }
            outbound = outbound.header(name.as_str(), value.as_bytes());
        }

        let upstream_response = match outbound.body(body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(url = %url, error = %e, "upstream dispatch failed");
                return (StatusCode::BAD_GATEWAY, "Upstream dispatch failed").into_response();
            }
        };

        let status = StatusCode::from_u16(upstream_response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        for (name, value) in upstream_response.headers() {
            let lowered = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lowered.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        match upstream_response.bytes().await {
            Ok(bytes) => builder
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()),
            Err(e) => {
                warn!(url = %url, error = %e, "failed to read upstream body");
                (StatusCode::BAD_GATEWAY, "Upstream dispatch failed").into_response()
            }
        }
    }
}
