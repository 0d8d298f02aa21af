//! The session store seam.
//!
//! `SessionStore` is the abstract TTL'd key/value store holding session
//! records and the rate/quota counters that guard them. It is the only
//! serialization point shared across gateway processes: the limiter
//! primitives (`incr_rate_window`, `consume_quota`) must be atomic at the
//! store layer, and application code never does read-then-write around them.
//!
//! `MemorySessionStore` is the single-process implementation used in dev and
//! tests; a networked store implements the same trait with the same
//! atomicity guarantees.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::StoreError;
use crate::session::SessionState;

/// Current unix time in whole seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Outcome of one atomic quota consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaVerdict {
    pub allowed: bool,
    pub remaining: i64,
    pub renews_at: i64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the session stored under `key`, if present and unexpired.
    async fn get_session_detail(&self, key: &str) -> Result<Option<SessionState>, StoreError>;

    /// Write `session` under `key` with the given TTL, replacing any
    /// previous record.
    async fn update_session(
        &self,
        key: &str,
        session: &SessionState,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn remove_session(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically count a request against the fixed window of length `per`
    /// for `key`, returning the post-increment count for the current window.
    async fn incr_rate_window(&self, key: &str, per: Duration) -> Result<u64, StoreError>;

    /// Atomically consume one unit of quota for `key`.
    ///
    /// When `now >= renews_at` the counter resets to `max` and `renews_at`
    /// advances by `renewal_rate` before the unit is consumed.
    async fn consume_quota(
        &self,
        key: &str,
        max: i64,
        renewal_rate: Duration,
        now: u64,
    ) -> Result<QuotaVerdict, StoreError>;
}

#[derive(Debug, Clone)]
struct SessionEntry {
    expires_at: Instant,
    value: SessionState,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: u64,
    count: u64,
}

#[derive(Debug, Clone, Copy)]
struct QuotaCell {
    used: i64,
    renews_at: i64,
}

/// In-process `SessionStore`. Mutex-held read-modify-write gives the
/// atomicity the trait demands.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    rate_windows: Mutex<HashMap<String, RateWindow>>,
    quotas: Mutex<HashMap<String, QuotaCell>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired session entries. Counters are self-resetting and are
    /// left in place.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.sessions.lock().retain(|_, e| e.expires_at > now);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session_detail(&self, key: &str) -> Result<Option<SessionState>, StoreError> {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get(key) else {
            return Ok(None);
        };
        if entry.expires_at <= Instant::now() {
            sessions.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn update_session(
        &self,
        key: &str,
        session: &SessionState,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.sessions.lock().insert(
            key.to_string(),
            SessionEntry {
                expires_at: Instant::now() + ttl,
                value: session.clone(),
            },
        );
        Ok(())
    }

    async fn remove_session(&self, key: &str) -> Result<(), StoreError> {
        self.sessions.lock().remove(key);
        Ok(())
    }

    async fn incr_rate_window(&self, key: &str, per: Duration) -> Result<u64, StoreError> {
        let per_secs = per.as_secs().max(1);
        let now = unix_now();
        let window_start = now - now % per_secs;

        let mut windows = self.rate_windows.lock();
        let window = windows.entry(key.to_string()).or_insert(RateWindow {
            window_start,
            count: 0,
        });
        if window.window_start != window_start {
            window.window_start = window_start;
            window.count = 0;
        }
        window.count += 1;
        Ok(window.count)
    }

    async fn consume_quota(
        &self,
        key: &str,
        max: i64,
        renewal_rate: Duration,
        now: u64,
    ) -> Result<QuotaVerdict, StoreError> {
        let now = now as i64;
        let renewal = renewal_rate.as_secs() as i64;

        let mut quotas = self.quotas.lock();
        let cell = quotas.entry(key.to_string()).or_insert(QuotaCell {
            used: 0,
            renews_at: now + renewal,
        });
        if now >= cell.renews_at {
            cell.used = 0;
            cell.renews_at = now + renewal;
        }
        cell.used += 1;
        let allowed = cell.used <= max;
        if !allowed {
            // Refused units are not consumed.
            cell.used -= 1;
        }
        Ok(QuotaVerdict {
            allowed,
            remaining: (max - cell.used).max(0),
            renews_at: cell.renews_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_expire_on_ttl() {
        let store = MemorySessionStore::new();
        let session = SessionState::default();
        store
            .update_session("k1", &session, Duration::from_millis(20))
            .await
            .expect("put");
        assert!(store.get_session_detail("k1").await.expect("get").is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get_session_detail("k1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn remove_deletes_the_record() {
        let store = MemorySessionStore::new();
        store
            .update_session("k1", &SessionState::default(), Duration::from_secs(60))
            .await
            .expect("put");
        store.remove_session("k1").await.expect("remove");
        assert!(store.get_session_detail("k1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn rate_window_counts_and_resets() {
        let store = MemorySessionStore::new();
        let per = Duration::from_secs(60);
        assert_eq!(store.incr_rate_window("k1", per).await.expect("incr"), 1);
        assert_eq!(store.incr_rate_window("k1", per).await.expect("incr"), 2);
        assert_eq!(store.incr_rate_window("k2", per).await.expect("incr"), 1);
    }

    #[tokio::test]
    async fn quota_consumes_down_to_zero_then_refuses() {
        let store = MemorySessionStore::new();
        let renewal = Duration::from_secs(3600);
        let now = unix_now();
        for expected_remaining in (0..2).rev() {
            let v = store
                .consume_quota("q1", 2, renewal, now)
                .await
                .expect("consume");
            assert!(v.allowed);
            assert_eq!(v.remaining, expected_remaining);
        }
        let v = store
            .consume_quota("q1", 2, renewal, now)
            .await
            .expect("consume");
        assert!(!v.allowed);
        assert_eq!(v.remaining, 0);
    }

    #[tokio::test]
    async fn quota_resets_at_renewal() {
        let store = MemorySessionStore::new();
        let renewal = Duration::from_secs(100);
        let now = unix_now();
        let first = store
            .consume_quota("q1", 1, renewal, now)
            .await
            .expect("consume");
        assert!(first.allowed);
        assert!(
            !store
                .consume_quota("q1", 1, renewal, now)
                .await
                .expect("consume")
                .allowed
        );

        // Past the renewal boundary the counter resets to max.
        let later = now + 101;
        let renewed = store
            .consume_quota("q1", 1, renewal, later)
            .await
            .expect("consume");
        assert!(renewed.allowed);
        assert_eq!(renewed.renews_at, later as i64 + 100);
    }

    #[tokio::test]
    async fn purge_expired_drops_only_dead_entries() {
        let store = MemorySessionStore::new();
        let session = SessionState::default();
        store
            .update_session("live", &session, Duration::from_secs(60))
            .await
            .expect("put");
        store
            .update_session("dead", &session, Duration::from_millis(1))
            .await
            .expect("put");
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.purge_expired();
        assert!(
            store
                .get_session_detail("live")
                .await
                .expect("get")
                .is_some()
        );
        assert!(
            store
                .get_session_detail("dead")
                .await
                .expect("get")
                .is_none()
        );
    }
}
