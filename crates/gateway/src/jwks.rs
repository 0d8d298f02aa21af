//! JWKS retrieval and the per-API key-set cache.
//!
//! Each API binds to exactly one JWKS endpoint, so the cache is keyed by
//! API-ID rather than URL. Inside the freshness window the cached set is the
//! only source of truth; a kid that is absent from a fresh set fails without
//! a refetch. Entries are also swept by a background task so an idle API
//! does not pin a stale set in memory.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(240);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One verification key as served by a JWKS endpoint. Fields beyond the ones
/// consumed here are tolerated and dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    #[serde(default)]
    pub alg: Option<String>,
    pub kty: String,
    #[serde(rename = "use", default)]
    pub use_: Option<String>,
    /// Base64 (standard alphabet) X.509 certificate chain.
    #[serde(default)]
    pub x5c: Vec<String>,
    /// RSA modulus/exponent, base64url.
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
}

/// Ordered key set; the first match wins.
#[derive(Debug, Clone, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    #[error("failed to fetch jwks: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to parse jwks document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to decode jwk certificate: {0}")]
    CertDecode(#[from] base64::DecodeError),

    #[error("no jwk matches the requested kid")]
    NoMatchingKid,

    #[error("matching jwk has an empty certificate chain")]
    NoCertificate,
}

/// Verification material extracted from a matching JWK.
///
/// The DER bytes come from the first certificate of the chain; RSA callers
/// prefer the modulus/exponent components when the endpoint publishes them.
#[derive(Debug, Clone)]
pub struct JwksKeyMaterial {
    pub certificate_der: Vec<u8>,
    pub rsa_components: Option<(String, String)>,
}

struct Entry {
    fetched_at: Instant,
    set: Arc<JwkSet>,
}

pub struct JwksCache {
    ttl: Duration,
    http: reqwest::Client,
    inner: RwLock<HashMap<String, Entry>>,
}

impl JwksCache {
    #[must_use]
    pub fn new(http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            ttl,
            http,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Key material for `kid` under `api_id`, fetching from `url` when the
    /// cached set is missing or stale.
    ///
    /// Matching requires kid equality and a case-insensitive key-type match.
    ///
    /// # Errors
    ///
    /// `Network`/`Decode` when the endpoint cannot be fetched or parsed,
    /// `NoMatchingKid` when no key matches, `NoCertificate` when the
    /// matching key has an empty chain.
    pub async fn key_material(
        &self,
        api_id: &str,
        url: &str,
        kid: &str,
        key_type: &str,
    ) -> Result<JwksKeyMaterial, JwksError> {
        if let Some(set) = self.fresh_set(api_id).await {
            // Fresh set is authoritative: a missing kid fails here rather
            // than triggering a refetch storm.
            return material_from_set(&set, kid, key_type);
        }

        let set = self.refresh(api_id, url).await?;
        material_from_set(&set, kid, key_type)
    }

    async fn fresh_set(&self, api_id: &str) -> Option<Arc<JwkSet>> {
        let map = self.inner.read().await;
        let entry = map.get(api_id)?;
        if entry.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.set.clone())
    }

    /// Fetch and store the key set for `api_id`, holding the write half so
    /// concurrent cold requests produce one fetch, not a stampede.
    async fn refresh(&self, api_id: &str, url: &str) -> Result<Arc<JwkSet>, JwksError> {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get(api_id)
            && entry.fetched_at.elapsed() < self.ttl
        {
            // Someone else refreshed while we waited for the lock.
            return Ok(entry.set.clone());
        }

        debug!(api_id, url, "fetching jwks");
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let set: JwkSet = serde_json::from_str(&body)?;
        let set = Arc::new(set);

        map.insert(
            api_id.to_string(),
            Entry {
                fetched_at: Instant::now(),
                set: set.clone(),
            },
        );
        Ok(set)
    }

    /// Drop entries past the freshness window.
    pub async fn sweep(&self) {
        let ttl = self.ttl;
        self.inner
            .write()
            .await
            .retain(|_, entry| entry.fetched_at.elapsed() < ttl);
    }

    /// Periodic eviction sweep; runs until `shutdown` is cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let cache = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => cache.sweep().await,
                    _ = shutdown.cancelled() => {
                        info!("jwks sweeper shutting down");
                        return;
                    }
                }
            }
        });
    }
}

fn material_from_set(set: &JwkSet, kid: &str, key_type: &str) -> Result<JwksKeyMaterial, JwksError> {
    let jwk = set
        .keys
        .iter()
        .find(|k| {
            k.kid.as_deref() == Some(kid) && k.kty.eq_ignore_ascii_case(key_type)
        })
        .ok_or(JwksError::NoMatchingKid)?;

    if let Some(use_) = &jwk.use_
        && use_ != "sig"
    {
        warn!(kid, use_ = %use_, "jwk matched by kid is not a signing key");
    }

    let Some(first_cert) = jwk.x5c.first() else {
        return Err(JwksError::NoCertificate);
    };
    let certificate_der = STANDARD.decode(first_cert)?;

    let rsa_components = match (&jwk.n, &jwk.e) {
        (Some(n), Some(e)) => Some((n.clone(), e.clone())),
        _ => None,
    };

    Ok(JwksKeyMaterial {
        certificate_der,
        rsa_components,
    })
}
