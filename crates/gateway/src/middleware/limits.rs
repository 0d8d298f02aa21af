//! Rate-limit and quota middleware.
//!
//! Runs after jwt auth, reading the bound session from the request context.
//! When the session declares a per-API policy and the sub-session exists in
//! the store, that sub-session's counters are the ones enforced; otherwise
//! enforcement falls back to the base session.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{info, warn};

use super::{bound_api, bound_context, chain_miswired, request_origin};
use crate::error::AuthError;
use crate::events::{EventKind, encode_request_snapshot};
use crate::limiter::ForwardReason;
use crate::session::{SessionState, per_api_session_key};
use crate::state::GatewayState;
use crate::store::unix_now;

pub async fn limits(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(api) = bound_api(&request) else {
        return chain_miswired("api");
    };
    let Some(ctx) = bound_context(&request) else {
        return chain_miswired("context");
    };
    let (Some(session), Some(base_key)) = (ctx.session(), ctx.auth_key()) else {
        return chain_miswired("session");
    };

    // Per-API counters apply only when the sub-session has been
    // materialized; a miss falls back to the base session.
    let has_per_api_policy = session.per_api_policy(&api.api_id).is_some();
    let (limit_key, mut limit_session) = if has_per_api_policy {
        let api_key = per_api_session_key(&base_key, &api.api_id);
        match state.session_store.get_session_detail(&api_key).await {
            Ok(Some(sub)) => (api_key, sub),
            Ok(None) => (base_key.clone(), session),
            Err(e) => return AuthError::from(e).into_response(),
        }
    } else {
        (base_key.clone(), session)
    };

    let reason = match state
        .limiter
        .forward_message(
            &mut limit_session,
            &limit_key,
            &state.session_store,
            &api.api_id,
            unix_now(),
        )
        .await
    {
        Ok(reason) => reason,
        Err(e) => return AuthError::from(e).into_response(),
    };

    let origin = request_origin(&request);
    let path = request.uri().path().to_string();

    match reason {
        ForwardReason::Allowed => {
            if let Err(e) =
                persist_counters(&state, &ctx, &limit_key, &base_key, &limit_session).await
            {
                return AuthError::from(e).into_response();
            }
            if state.config.monitor.enabled {
                let thresholds = state.config.monitor.quota_usage_thresholds.clone();
                let snapshot = limit_session.clone();
                let key = limit_key.clone();
                tokio::spawn(async move { evaluate_quota_triggers(&thresholds, &snapshot, &key) });
            }
            next.run(request).await
        }
        ForwardReason::RateExceeded => {
            info!(path = %path, origin = %origin, key = %limit_key, "rate limit exceeded");
            state.health.record_throttle();
            let snapshot =
                encode_request_snapshot(request.method(), request.uri(), &origin, request.headers());
            state.events.emit(
                EventKind::RateLimitExceeded,
                Some(limit_key),
                &path,
                &origin,
                snapshot,
            );
            AuthError::RateExceeded.into_response()
        }
        ForwardReason::QuotaExceeded => {
            info!(path = %path, origin = %origin, key = %limit_key, "quota exceeded");
            state.health.record_quota_violation();
            let snapshot =
                encode_request_snapshot(request.method(), request.uri(), &origin, request.headers());
            state.events.emit(
                EventKind::QuotaExceeded,
                Some(limit_key),
                &path,
                &origin,
                snapshot,
            );
            AuthError::QuotaExceeded.into_response()
        }
        ForwardReason::Denied => {
            info!(path = %path, origin = %origin, key = %limit_key, "access denied");
            AuthError::AccessDenied.into_response()
        }
    }
}

/// Write back the enforced session and refresh the context binding.
///
/// In async mode both happen on fire-and-forget tasks: the response does
/// not wait, a failed write is logged and discarded, and counters may not
/// be visible to a read issued within the same request chain. Callers that
/// need read-after-write run synchronous mode.
async fn persist_counters(
    state: &Arc<GatewayState>,
    ctx: &crate::context::RequestContext,
    limit_key: &str,
    base_key: &str,
    limit_session: &SessionState,
) -> Result<(), crate::error::StoreError> {
    let ttl = limit_session.lifetime(state.config.session_lifetime_secs);

    if state.config.use_async_session_write {
        let store = state.session_store.clone();
        let key = limit_key.to_string();
        let snapshot = limit_session.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_session(&key, &snapshot, ttl).await {
                warn!(key = %key, error = %e, "async session write failed");
            }
        });

        let ctx = ctx.clone();
        let session_for_ctx = limit_session.clone();
        let key_for_ctx = base_key.to_string();
        tokio::spawn(async move { ctx.bind_session(session_for_ctx, key_for_ctx) });
        return Ok(());
    }

    state
        .session_store
        .update_session(limit_key, limit_session, ttl)
        .await?;
    ctx.bind_session(limit_session.clone(), base_key.to_string());
    Ok(())
}

/// Fire-and-forget quota usage monitor: log the highest threshold crossed.
fn evaluate_quota_triggers(thresholds: &[u8], session: &SessionState, key: &str) {
    if session.quota_max <= 0 || thresholds.is_empty() {
        return;
    }
    let used = session.quota_max - session.quota_remaining.max(0);
    let usage_percent = used.saturating_mul(100) / session.quota_max;
    if let Some(crossed) = thresholds
        .iter()
        .filter(|&&t| usage_percent >= i64::from(t))
        .max()
    {
        warn!(
            key = %key,
            usage_percent,
            threshold = crossed,
            "quota usage trigger fired"
        );
    }
}
