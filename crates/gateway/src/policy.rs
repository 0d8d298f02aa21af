//! Policy templates and the process-wide registry.
//!
//! Policies are immutable rate/quota/access templates owned by an
//! organization. The registry is read-mostly: lookups take an `Arc` snapshot
//! and `replace` swaps the whole map, so a reload never invalidates sessions
//! that already copied policy fields by value.

use anyhow::Context as _;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::session::{AccessSpec, SessionState};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub id: String,
    pub org_id: String,
    pub rate: f64,
    pub per: f64,
    pub quota_max: i64,
    pub quota_renewal_rate: i64,
    pub policy_per_api: HashMap<String, String>,
    pub access_rights: HashMap<String, AccessSpec>,
    pub hmac_enabled: bool,
    pub active: bool,
    pub is_inactive: bool,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_expires_in: Option<u64>,
}

impl Policy {
    /// Copy this policy's limit and access fields into `session` by value.
    ///
    /// Quota counters (`quota_remaining`, `quota_renews_at`) are left alone:
    /// an overlay changes the ceiling, not the consumption so far.
    pub fn overlay_onto(&self, session: &mut SessionState) {
        session.rate = self.rate;
        session.allowance = self.rate;
        session.per = self.per;
        session.quota_max = self.quota_max;
        session.quota_renewal_rate = self.quota_renewal_rate;
        session.policy_per_api = self.policy_per_api.clone();
        session.access_rights = self.access_rights.clone();
        session.hmac_enabled = self.hmac_enabled;
        session.is_inactive = self.is_inactive;
        session.tags = self.tags.clone();
    }
}

/// Process-wide policy-ID -> `Policy` map, swapped atomically on reload.
pub struct PolicyRegistry {
    inner: RwLock<Arc<HashMap<String, Policy>>>,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new(policies: HashMap<String, Policy>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(policies)),
        }
    }

    #[must_use]
    pub fn get(&self, policy_id: &str) -> Option<Policy> {
        self.inner.read().get(policy_id).cloned()
    }

    /// Snapshot of the current map; safe to hold across awaits.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, Policy>> {
        self.inner.read().clone()
    }

    /// Replace the whole map. Readers holding an old snapshot are unaffected.
    pub fn replace(&self, policies: HashMap<String, Policy>) {
        let fingerprint = registry_fingerprint(&policies);
        *self.inner.write() = Arc::new(policies);
        tracing::info!(%fingerprint, "policy registry replaced");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Load a policy document: a JSON object mapping policy-ID to policy body.
///
/// The `id` field inside each body is optional; the map key wins when the
/// body omits it.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid policy
/// document.
pub fn load_policies_from_file(path: &Path) -> anyhow::Result<HashMap<String, Policy>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read policies file {}", path.display()))?;
    let mut policies: HashMap<String, Policy> = serde_json::from_str(&raw)
        .with_context(|| format!("parse policies file {}", path.display()))?;
    for (key, policy) in &mut policies {
        if policy.id.is_empty() {
            policy.id = key.clone();
        }
    }
    tracing::info!(
        count = policies.len(),
        fingerprint = %registry_fingerprint(&policies),
        "policies loaded"
    );
    Ok(policies)
}

/// Stable digest of a policy map, logged on load/replace so operators can
/// spot drift between gateway instances.
fn registry_fingerprint(policies: &HashMap<String, Policy>) -> String {
    let mut ids: Vec<&String> = policies.keys().collect();
    ids.sort();
    let mut hasher = sha2::Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        if let Ok(body) = serde_json::to_vec(&policies[id]) {
            hasher.update(&body);
        }
    }
    hex::encode(&hasher.finalize()[..8])
}
