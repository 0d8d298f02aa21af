//! Session resolution.
//!
//! Lookups walk a three-rung ladder: the in-process cache, the session
//! store, then the lower-level auth store, with backfill on the way up.
//! Resolution also applies any pending policy overlay and materializes
//! per-API sub-sessions declared by the base session's `policy_per_api`
//! map.

use std::sync::Arc;
use tracing::{error, warn};

use crate::config::ApiConfig;
use crate::error::StoreError;
use crate::policy::PolicyRegistry;
use crate::session::{SessionState, per_api_session_key};
use crate::session_cache::LocalSessionCache;
use crate::store::SessionStore;

/// Resolves sessions for one API. Cheap to construct per request; every
/// field is a shared handle.
pub struct SessionResolver {
    pub local_cache: Option<Arc<LocalSessionCache>>,
    pub session_store: Arc<dyn SessionStore>,
    pub auth_store: Arc<dyn SessionStore>,
    pub policies: Arc<PolicyRegistry>,
    pub api: Arc<ApiConfig>,
    pub default_lifetime_secs: u64,
}

impl SessionResolver {
    /// Resolve `key`, materializing the per-API sub-session when the base
    /// session declares an override for the current API.
    ///
    /// Only the base session is returned; the sub-session lives in the
    /// store under `key + ".API-" + api_id` and is consulted at limit time.
    ///
    /// # Errors
    ///
    /// Propagates store failures. Lookup misses are `Ok(None)`.
    pub async fn check_session_and_identity(
        &self,
        key: &str,
    ) -> Result<Option<SessionState>, StoreError> {
        let Some(base) = self.check_and_validate(key).await? else {
            return Ok(None);
        };

        if let Some(policy_id) = base.per_api_policy(&self.api.api_id) {
            let api_key = per_api_session_key(key, &self.api.api_id);
            if self.check_and_validate(&api_key).await?.is_none() {
                let mut per_api = SessionState {
                    apply_policy_id: Some(policy_id.to_string()),
                    ..SessionState::default()
                };
                self.apply_policy(&api_key, &mut per_api, true).await?;
            }
        }

        Ok(Some(base))
    }

    /// One rung-by-rung lookup of `key` with policy overlay on hit.
    pub async fn check_and_validate(
        &self,
        key: &str,
    ) -> Result<Option<SessionState>, StoreError> {
        if let Some(cache) = &self.local_cache
            && let Some(mut session) = cache.get(key)
        {
            self.apply_policy(key, &mut session, false).await?;
            return Ok(Some(session));
        }

        if let Some(mut session) = self.session_store.get_session_detail(key).await? {
            if let Some(cache) = &self.local_cache {
                let cache = cache.clone();
                let key = key.to_string();
                let snapshot = session.clone();
                tokio::spawn(async move { cache.put(&key, snapshot) });
            }
            self.apply_policy(key, &mut session, false).await?;
            return Ok(Some(session));
        }

        if let Some(mut session) = self.auth_store.get_session_detail(key).await? {
            if let Some(cache) = &self.local_cache {
                cache.put(key, session.clone());
            }
            self.apply_policy(key, &mut session, false).await?;
            // Promote into the session store so the next lookup stops a
            // rung earlier.
            self.session_store
                .update_session(key, &session, session.lifetime(self.default_lifetime_secs))
                .await?;
            return Ok(Some(session));
        }

        Ok(None)
    }

    /// Overlay the policy named by `session.apply_policy_id`, if any.
    ///
    /// A missing policy leaves the session untouched; a policy owned by a
    /// different organization is refused the same way. Both are logged, and
    /// the request proceeds with whatever the session already had.
    ///
    /// # Errors
    ///
    /// Propagates store failures from the persist.
    pub async fn apply_policy(
        &self,
        key: &str,
        session: &mut SessionState,
        strip_apply_id: bool,
    ) -> Result<(), StoreError> {
        let Some(policy_id) = session
            .apply_policy_id
            .clone()
            .filter(|id| !id.is_empty())
        else {
            return Ok(());
        };

        let Some(policy) = self.policies.get(&policy_id) else {
            warn!(policy_id = %policy_id, key, "session names an unknown policy");
            return Ok(());
        };
        if policy.org_id != self.api.org_id {
            error!(
                policy_id = %policy_id,
                policy_org = %policy.org_id,
                api_org = %self.api.org_id,
                "refusing cross-org policy application"
            );
            return Ok(());
        }

        policy.overlay_onto(session);
        if strip_apply_id {
            session.apply_policy_id = None;
        }
        self.session_store
            .update_session(key, session, session.lifetime(self.default_lifetime_secs))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthTokenConfig;
    use crate::policy::Policy;
    use crate::store::MemorySessionStore;
    use std::collections::HashMap;
    use std::time::Duration;

    fn api(api_id: &str, org_id: &str) -> Arc<ApiConfig> {
        Arc::new(ApiConfig {
            api_id: api_id.into(),
            org_id: org_id.into(),
            name: String::new(),
            listen_path: format!("/{api_id}"),
            upstream_url: "http://127.0.0.1:1".into(),
            auth: AuthTokenConfig::default(),
            signing_method: "hmac".into(),
            jwt_source: None,
            jwt_identity_base_field: None,
            jwt_policy_field_name: None,
        })
    }

    fn resolver(
        api: Arc<ApiConfig>,
        policies: HashMap<String, Policy>,
    ) -> (SessionResolver, Arc<MemorySessionStore>, Arc<MemorySessionStore>) {
        let session_store = Arc::new(MemorySessionStore::new());
        let auth_store = Arc::new(MemorySessionStore::new());
        let resolver = SessionResolver {
            local_cache: Some(Arc::new(LocalSessionCache::new(Duration::from_secs(10)))),
            session_store: session_store.clone(),
            auth_store: auth_store.clone(),
            policies: Arc::new(PolicyRegistry::new(policies)),
            api,
            default_lifetime_secs: 60,
        };
        (resolver, session_store, auth_store)
    }

    fn fast_policy(org: &str) -> Policy {
        Policy {
            id: "p_fast".into(),
            org_id: org.into(),
            rate: 100.0,
            per: 1.0,
            quota_max: -1,
            active: true,
            ..Policy::default()
        }
    }

    #[tokio::test]
    async fn miss_on_every_rung_returns_none() {
        let (resolver, _, _) = resolver(api("a1", "o1"), HashMap::new());
        assert!(
            resolver
                .check_session_and_identity("nope")
                .await
                .expect("resolve")
                .is_none()
        );
    }

    #[tokio::test]
    async fn auth_store_hit_promotes_to_session_store() {
        let (resolver, session_store, auth_store) = resolver(api("a1", "o1"), HashMap::new());
        let seeded = SessionState {
            rate: 3.0,
            ..SessionState::default()
        };
        auth_store
            .update_session("k1", &seeded, Duration::from_secs(60))
            .await
            .expect("seed");

        let found = resolver
            .check_session_and_identity("k1")
            .await
            .expect("resolve")
            .expect("found");
        assert_eq!(found.rate, 3.0);
        assert!(
            session_store
                .get_session_detail("k1")
                .await
                .expect("get")
                .is_some()
        );
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let (resolver, session_store, _) = resolver(api("a1", "o1"), HashMap::new());
        let seeded = SessionState {
            rate: 2.0,
            per: 60.0,
            ..SessionState::default()
        };
        session_store
            .update_session("k1", &seeded, Duration::from_secs(60))
            .await
            .expect("seed");

        let first = resolver
            .check_session_and_identity("k1")
            .await
            .expect("resolve")
            .expect("found");
        let second = resolver
            .check_session_and_identity("k1")
            .await
            .expect("resolve")
            .expect("found");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn overlay_applies_same_org_policy() {
        let (resolver, session_store, _) = resolver(
            api("a1", "o1"),
            HashMap::from([("p_fast".to_string(), fast_policy("o1"))]),
        );
        let seeded = SessionState {
            rate: 1.0,
            apply_policy_id: Some("p_fast".into()),
            ..SessionState::default()
        };
        session_store
            .update_session("k1", &seeded, Duration::from_secs(60))
            .await
            .expect("seed");

        let found = resolver
            .check_session_and_identity("k1")
            .await
            .expect("resolve")
            .expect("found");
        assert_eq!(found.rate, 100.0);
    }

    #[tokio::test]
    async fn cross_org_overlay_is_a_no_op() {
        let (resolver, session_store, _) = resolver(
            api("a1", "o1"),
            HashMap::from([("p_fast".to_string(), fast_policy("o2"))]),
        );
        let seeded = SessionState {
            rate: 1.0,
            apply_policy_id: Some("p_fast".into()),
            ..SessionState::default()
        };
        session_store
            .update_session("k1", &seeded, Duration::from_secs(60))
            .await
            .expect("seed");

        let found = resolver
            .check_session_and_identity("k1")
            .await
            .expect("resolve")
            .expect("found");
        assert_eq!(found.rate, 1.0);
        assert_eq!(found.apply_policy_id.as_deref(), Some("p_fast"));
    }

    #[tokio::test]
    async fn per_api_session_is_materialized_with_policy_fields() {
        let (resolver, session_store, _) = resolver(
            api("a1", "o1"),
            HashMap::from([("p_fast".to_string(), fast_policy("o1"))]),
        );
        let seeded = SessionState {
            rate: 1.0,
            policy_per_api: HashMap::from([("a1".to_string(), "p_fast".to_string())]),
            ..SessionState::default()
        };
        session_store
            .update_session("k1", &seeded, Duration::from_secs(60))
            .await
            .expect("seed");

        let base = resolver
            .check_session_and_identity("k1")
            .await
            .expect("resolve")
            .expect("found");
        // The call returns the base session...
        assert_eq!(base.rate, 1.0);

        // ...while the sub-session landed in the store with the policy's
        // fields and the transient apply id stripped.
        let sub = session_store
            .get_session_detail("k1.API-a1")
            .await
            .expect("get")
            .expect("materialized");
        assert_eq!(sub.rate, 100.0);
        assert_eq!(sub.quota_max, -1);
        assert!(sub.apply_policy_id.is_none());
    }

    #[tokio::test]
    async fn per_api_session_is_not_rebuilt_when_present() {
        let (resolver, session_store, _) = resolver(
            api("a1", "o1"),
            HashMap::from([("p_fast".to_string(), fast_policy("o1"))]),
        );
        let existing_sub = SessionState {
            rate: 42.0,
            ..SessionState::default()
        };
        session_store
            .update_session("k1.API-a1", &existing_sub, Duration::from_secs(60))
            .await
            .expect("seed sub");
        let seeded = SessionState {
            policy_per_api: HashMap::from([("a1".to_string(), "p_fast".to_string())]),
            ..SessionState::default()
        };
        session_store
            .update_session("k1", &seeded, Duration::from_secs(60))
            .await
            .expect("seed");

        resolver
            .check_session_and_identity("k1")
            .await
            .expect("resolve")
            .expect("found");
        let sub = session_store
            .get_session_detail("k1.API-a1")
            .await
            .expect("get")
            .expect("sub");
        assert_eq!(sub.rate, 42.0);
    }
}
