//! Process-wide gateway state and router assembly.
//!
//! Everything shared across requests is created once at startup and handed
//! to axum as an `Arc`; nothing on the hot path lazily initializes.

use anyhow::Context as _;
use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, middleware as axum_middleware};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ApiConfig, GatewayConfig};
use crate::events::EventBus;
use crate::health::{HealthCounters, HealthReport};
use crate::jwks::JwksCache;
use crate::limiter::SessionLimiter;
use crate::middleware::{jwt_auth, limits, select_api};
use crate::policy::{Policy, PolicyRegistry};
use crate::resolver::SessionResolver;
use crate::session_cache::LocalSessionCache;
use crate::store::SessionStore;
use crate::upstream::{HttpUpstream, UpstreamDispatcher};

pub struct GatewayState {
    pub config: GatewayConfig,
    /// APIs sorted by listen-path length, longest first, so prefix matching
    /// picks the most specific API.
    apis: Vec<Arc<ApiConfig>>,
    pub policies: Arc<PolicyRegistry>,
    pub session_store: Arc<dyn SessionStore>,
    pub auth_store: Arc<dyn SessionStore>,
    pub local_cache: Option<Arc<LocalSessionCache>>,
    pub jwks: Arc<JwksCache>,
    pub events: Arc<EventBus>,
    pub health: Arc<HealthCounters>,
    pub limiter: SessionLimiter,
    pub upstream: Arc<dyn UpstreamDispatcher>,
}

impl GatewayState {
    /// Build the shared state. Stores are injected so deployments (and
    /// tests) choose their own backing.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound HTTP client cannot be constructed.
    pub fn new(
        config: GatewayConfig,
        policies: HashMap<String, Policy>,
        session_store: Arc<dyn SessionStore>,
        auth_store: Arc<dyn SessionStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .context("build outbound http client")?;

        let mut apis: Vec<Arc<ApiConfig>> = config.apis.iter().cloned().map(Arc::new).collect();
        apis.sort_by(|a, b| b.listen_path.len().cmp(&a.listen_path.len()));

        let local_cache = config.local_session_cache.enabled.then(|| {
            Arc::new(LocalSessionCache::new(Duration::from_secs(
                config.local_session_cache.ttl_secs.max(1),
            )))
        });

        let jwks = Arc::new(JwksCache::new(
            http.clone(),
            Duration::from_secs(config.jwks_cache.ttl_secs.max(1)),
        ));

        Ok(Arc::new(Self {
            apis,
            policies: Arc::new(PolicyRegistry::new(policies)),
            session_store,
            auth_store,
            local_cache,
            jwks,
            events: Arc::new(EventBus::new()),
            health: Arc::new(HealthCounters::default()),
            limiter: SessionLimiter,
            upstream: Arc::new(HttpUpstream::new(http)),
            config,
        }))
    }

    /// The API whose listen path is the longest prefix of `path`.
    ///
    /// A prefix only matches on a path-segment boundary: `/widgets-admin`
    /// does not belong to the `/widgets` API.
    #[must_use]
    pub fn match_api(&self, path: &str) -> Option<Arc<ApiConfig>> {
        self.apis
            .iter()
            .find(|api| {
                let listen = api.listen_path.trim_end_matches('/');
                match path.strip_prefix(listen) {
                    Some(rest) => rest.is_empty() || rest.starts_with('/'),
                    None => false,
                }
            })
            .cloned()
    }

    /// A resolver bound to `api`; all fields are shared handles.
    #[must_use]
    pub fn resolver_for(&self, api: &Arc<ApiConfig>) -> SessionResolver {
        SessionResolver {
            local_cache: self.local_cache.clone(),
            session_store: self.session_store.clone(),
            auth_store: self.auth_store.clone(),
            policies: self.policies.clone(),
            api: api.clone(),
            default_lifetime_secs: self.config.session_lifetime_secs,
        }
    }
}

async fn health(State(state): State<Arc<GatewayState>>) -> Json<HealthReport> {
    Json(state.health.report())
}

async fn dispatch_upstream(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    let Some(api) = request.extensions().get::<Arc<ApiConfig>>().cloned() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Gateway misconfigured").into_response();
    };
    state.upstream.dispatch(&api, request).await
}

/// Assemble the full middleware chain plus the health endpoint.
#[must_use]
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let api_chain = Router::new()
        .fallback(dispatch_upstream)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            limits::limits,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            jwt_auth::jwt_auth,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            select_api,
        ));

    Router::new()
        .route("/gatehouse/health", get(health))
        .merge(api_chain)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthTokenConfig;
    use crate::store::MemorySessionStore;

    fn state_with_paths(paths: &[&str]) -> Arc<GatewayState> {
        let apis = paths
            .iter()
            .enumerate()
            .map(|(i, path)| ApiConfig {
                api_id: format!("a{i}"),
                org_id: "o1".into(),
                name: String::new(),
                listen_path: (*path).into(),
                upstream_url: "http://127.0.0.1:1".into(),
                auth: AuthTokenConfig::default(),
                signing_method: "hmac".into(),
                jwt_source: None,
                jwt_identity_base_field: None,
                jwt_policy_field_name: None,
            })
            .collect();
        let config = GatewayConfig {
            listen_addr: "127.0.0.1:0".into(),
            session_lifetime_secs: 60,
            local_session_cache: Default::default(),
            jwks_cache: Default::default(),
            use_async_session_write: false,
            monitor: Default::default(),
            http_timeout_secs: 5,
            policies_path: None,
            apis,
        };
        GatewayState::new(
            config,
            HashMap::new(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemorySessionStore::new()),
        )
        .expect("state")
    }

    #[test]
    fn longest_prefix_wins() {
        let state = state_with_paths(&["/widgets", "/widgets/v2"]);
        assert_eq!(
            state.match_api("/widgets/v2/list").expect("match").listen_path,
            "/widgets/v2"
        );
        assert_eq!(
            state.match_api("/widgets/list").expect("match").listen_path,
            "/widgets"
        );
    }

    #[test]
    fn prefix_matches_only_on_segment_boundaries() {
        let state = state_with_paths(&["/widgets"]);
        assert!(state.match_api("/widgets").is_some());
        assert!(state.match_api("/widgets/").is_some());
        assert!(state.match_api("/widgets-admin").is_none());
        assert!(state.match_api("/other").is_none());
    }
}
