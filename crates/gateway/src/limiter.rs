//! Rate and quota enforcement against the shared store.
//!
//! The limiter owns the decision for one forward attempt. Counter mutation
//! happens through the store's atomic primitives, so the verdict holds
//! across every gateway process sharing the store.

use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::session::SessionState;
use crate::store::SessionStore;

/// Why a forward was (or was not) allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardReason {
    Allowed,
    RateExceeded,
    QuotaExceeded,
    /// Inactive session, expired key, or access rights that exclude the
    /// current API.
    Denied,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionLimiter;

impl SessionLimiter {
    /// Decide one forward for `key` under `session`, updating the session's
    /// quota mirror from the store's verdict.
    ///
    /// The rate check runs first; a throttled request consumes no quota, and
    /// when both limits would fail the rate verdict wins.
    ///
    /// # Errors
    ///
    /// Propagates store failures; no verdict is implied.
    pub async fn forward_message(
        &self,
        session: &mut SessionState,
        key: &str,
        store: &Arc<dyn SessionStore>,
        api_id: &str,
        now: u64,
    ) -> Result<ForwardReason, StoreError> {
        if session.is_inactive || session.key_expired(now) || !session.allows_api(api_id) {
            return Ok(ForwardReason::Denied);
        }

        if session.rate > 0.0 && session.per > 0.0 {
            let count = store
                .incr_rate_window(&rate_counter_key(key), Duration::from_secs_f64(session.per))
                .await?;
            if count as f64 > session.rate {
                return Ok(ForwardReason::RateExceeded);
            }
        }

        if session.quota_max >= 0 {
            let verdict = store
                .consume_quota(
                    &quota_counter_key(key),
                    session.quota_max,
                    Duration::from_secs(session.quota_renewal_rate.max(0) as u64),
                    now,
                )
                .await?;
            session.quota_remaining = verdict.remaining;
            session.quota_renews_at = verdict.renews_at;
            if !verdict.allowed {
                return Ok(ForwardReason::QuotaExceeded);
            }
        }

        Ok(ForwardReason::Allowed)
    }
}

fn rate_counter_key(key: &str) -> String {
    format!("rate-limit-{key}")
}

fn quota_counter_key(key: &str) -> String {
    format!("quota-{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AccessSpec;
    use crate::store::{MemorySessionStore, unix_now};

    fn store() -> Arc<dyn SessionStore> {
        Arc::new(MemorySessionStore::new())
    }

    fn session(rate: f64, quota_max: i64) -> SessionState {
        SessionState {
            rate,
            allowance: rate,
            per: 60.0,
            quota_max,
            quota_remaining: quota_max.max(0),
            quota_renewal_rate: 3600,
            ..SessionState::default()
        }
    }

    #[tokio::test]
    async fn allows_until_rate_then_throttles() {
        let limiter = SessionLimiter;
        let store = store();
        let mut s = session(2.0, -1);
        let now = unix_now();
        for _ in 0..2 {
            let reason = limiter
                .forward_message(&mut s, "k1", &store, "a1", now)
                .await
                .expect("forward");
            assert_eq!(reason, ForwardReason::Allowed);
        }
        let reason = limiter
            .forward_message(&mut s, "k1", &store, "a1", now)
            .await
            .expect("forward");
        assert_eq!(reason, ForwardReason::RateExceeded);
    }

    #[tokio::test]
    async fn quota_runs_out_and_mirrors_into_the_session() {
        let limiter = SessionLimiter;
        let store = store();
        let mut s = session(0.0, 2);
        let now = unix_now();

        assert_eq!(
            limiter
                .forward_message(&mut s, "k1", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::Allowed
        );
        assert_eq!(s.quota_remaining, 1);

        limiter
            .forward_message(&mut s, "k1", &store, "a1", now)
            .await
            .expect("forward");
        assert_eq!(s.quota_remaining, 0);

        assert_eq!(
            limiter
                .forward_message(&mut s, "k1", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::QuotaExceeded
        );
    }

    #[tokio::test]
    async fn rate_wins_when_both_limits_would_fail() {
        let limiter = SessionLimiter;
        let store = store();
        // Quota already exhausted.
        let mut s = session(1.0, 0);
        let now = unix_now();
        assert_eq!(
            limiter
                .forward_message(&mut s, "k1", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::QuotaExceeded
        );
        // Second call inside the window fails rate and quota; rate reports.
        assert_eq!(
            limiter
                .forward_message(&mut s, "k1", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::RateExceeded
        );
    }

    #[tokio::test]
    async fn throttled_requests_consume_no_quota() {
        let limiter = SessionLimiter;
        let store = store();
        let mut s = session(1.0, 10);
        let now = unix_now();
        limiter
            .forward_message(&mut s, "k1", &store, "a1", now)
            .await
            .expect("forward");
        let before = s.quota_remaining;
        limiter
            .forward_message(&mut s, "k1", &store, "a1", now)
            .await
            .expect("forward");
        assert_eq!(s.quota_remaining, before);
    }

    #[tokio::test]
    async fn inactive_expired_and_unlisted_api_are_denied() {
        let limiter = SessionLimiter;
        let store = store();
        let now = unix_now();

        let mut inactive = session(10.0, -1);
        inactive.is_inactive = true;
        assert_eq!(
            limiter
                .forward_message(&mut inactive, "k1", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::Denied
        );

        let mut expired = session(10.0, -1);
        expired.key_expires_at = Some(now - 1);
        assert_eq!(
            limiter
                .forward_message(&mut expired, "k2", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::Denied
        );

        let mut scoped = session(10.0, -1);
        scoped
            .access_rights
            .insert("other-api".into(), AccessSpec::default());
        assert_eq!(
            limiter
                .forward_message(&mut scoped, "k3", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::Denied
        );
        scoped.access_rights.insert("a1".into(), AccessSpec::default());
        assert_eq!(
            limiter
                .forward_message(&mut scoped, "k3", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::Allowed
        );
    }

    #[tokio::test]
    async fn counters_are_independent_per_key() {
        let limiter = SessionLimiter;
        let store = store();
        let now = unix_now();
        let mut base = session(1.0, -1);
        let mut sub = session(1.0, -1);

        assert_eq!(
            limiter
                .forward_message(&mut base, "k1", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::Allowed
        );
        // A different key has its own window even at the same instant.
        assert_eq!(
            limiter
                .forward_message(&mut sub, "k1.API-a1", &store, "a1", now)
                .await
                .expect("forward"),
            ForwardReason::Allowed
        );
    }
}
