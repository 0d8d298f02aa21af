//! Session state for authenticated callers.
//!
//! A `SessionState` is the mutable record tracked per key: rate/quota
//! figures, access rights and the transient policy-overlay hint. Policy
//! fields are copied into it by value; a session never holds a handle to a
//! `Policy`, which is what allows policies to be hot-reloaded under live
//! sessions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Permitted surface of one API for a session: versions, paths, methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSpec {
    pub versions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_paths: Vec<AllowedPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowedPath {
    pub path: String,
    pub methods: Vec<String>,
}

/// Shared-secret material carried by a session for direct JWT verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtData {
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    /// Legacy mirror of `rate`; kept in sync on every write, read by nothing
    /// on the hot path.
    pub allowance: f64,
    /// Requests permitted per `per` seconds. Zero disables rate limiting.
    pub rate: f64,
    /// Rate window length in seconds.
    pub per: f64,
    /// Quota ceiling. Negative disables quota accounting.
    pub quota_max: i64,
    pub quota_remaining: i64,
    /// Seconds between quota renewals.
    pub quota_renewal_rate: i64,
    /// Unix seconds at which the quota counter resets.
    pub quota_renews_at: i64,
    /// API-ID -> policy-ID overrides; triggers per-API sub-session
    /// materialization.
    pub policy_per_api: HashMap<String, String>,
    /// API-ID -> permitted surface. Empty map means unrestricted.
    pub access_rights: HashMap<String, AccessSpec>,
    pub hmac_enabled: bool,
    pub is_inactive: bool,
    pub tags: Vec<String>,
    /// Transient overlay hint consumed by `SessionResolver::apply_policy`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_policy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    pub jwt_data: JwtData,
    /// Store TTL in seconds; zero falls back to the gateway default.
    pub session_lifetime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_expires_at: Option<u64>,
}

impl SessionState {
    /// TTL to use when persisting this session.
    #[must_use]
    pub fn lifetime(&self, default_secs: u64) -> Duration {
        let secs = if self.session_lifetime > 0 {
            self.session_lifetime
        } else {
            default_secs
        };
        Duration::from_secs(secs)
    }

    #[must_use]
    pub fn key_expired(&self, now_unix_secs: u64) -> bool {
        match self.key_expires_at {
            Some(exp) if exp > 0 => exp <= now_unix_secs,
            _ => false,
        }
    }

    /// Whether the session's access rights admit `api_id`.
    ///
    /// An empty map places no restriction; a non-empty map is an allowlist.
    #[must_use]
    pub fn allows_api(&self, api_id: &str) -> bool {
        self.access_rights.is_empty() || self.access_rights.contains_key(api_id)
    }

    /// Non-empty per-API policy override for `api_id`, if declared.
    #[must_use]
    pub fn per_api_policy(&self, api_id: &str) -> Option<&str> {
        self.policy_per_api
            .get(api_id)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }
}

/// Store key for the per-API sub-session of `base_key` under `api_id`.
///
/// The `<base>.API-<api id>` convention is part of the external contract;
/// counters for the sub-session are tracked independently under this key.
#[must_use]
pub fn per_api_session_key(base_key: &str, api_id: &str) -> String {
    format!("{base_key}.API-{api_id}")
}
