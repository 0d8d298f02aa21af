//! Short-TTL in-process cache of resolved sessions.
//!
//! Absorbs repeated lookups for the same key within a few seconds. Entries
//! are by-value snapshots; the session store stays authoritative for
//! counters, so a stale read inside the TTL is acceptable.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::session::SessionState;

#[derive(Debug, Clone)]
struct Entry {
    expires_at: Instant,
    value: SessionState,
}

pub struct LocalSessionCache {
    ttl: Duration,
    inner: RwLock<HashMap<String, Entry>>,
}

impl LocalSessionCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<SessionState> {
        let now = Instant::now();
        let mut map = self.inner.write();
        let entry = map.get(key)?;
        if entry.expires_at <= now {
            map.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: &str, session: SessionState) {
        let expires_at = Instant::now() + self.ttl;
        self.inner.write().insert(
            key.to_string(),
            Entry {
                expires_at,
                value: session,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.write().remove(key);
    }
}
