//! Gateway configuration.
//!
//! One YAML document configures the listener, cache/store behavior and the
//! set of fronted APIs. Signing methods are normalized at load time so the
//! per-request gate never has to re-parse them.

use anyhow::Context as _;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::jwks;

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_session_lifetime() -> u64 {
    3600
}

fn default_local_cache_ttl() -> u64 {
    10
}

fn default_jwks_ttl() -> u64 {
    jwks::DEFAULT_JWKS_TTL.as_secs()
}

fn default_jwks_sweep() -> u64 {
    jwks::DEFAULT_SWEEP_INTERVAL.as_secs()
}

fn default_http_timeout() -> u64 {
    10
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_signing_method() -> String {
    "hmac".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_local_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JwksCacheConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for JwksCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_jwks_ttl(),
            sweep_interval_secs: default_jwks_sweep(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Quota usage thresholds in percent; crossing one logs a trigger.
    pub quota_usage_thresholds: Vec<u8>,
}

/// Where the bearer credential may arrive for an API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthTokenConfig {
    pub header_name: String,
    pub use_param: bool,
    /// Defaults to `header_name` when unset.
    pub param_name: Option<String>,
    pub use_cookie: bool,
    /// Defaults to `header_name` when unset.
    pub cookie_name: Option<String>,
}

impl Default for AuthTokenConfig {
    fn default() -> Self {
        Self {
            header_name: default_auth_header(),
            use_param: false,
            param_name: None,
            use_cookie: false,
            cookie_name: None,
        }
    }
}

impl AuthTokenConfig {
    #[must_use]
    pub fn param_name(&self) -> &str {
        self.param_name.as_deref().unwrap_or(&self.header_name)
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        self.cookie_name.as_deref().unwrap_or(&self.header_name)
    }
}

/// Signing-method family an API accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningMethod {
    Hmac,
    Rsa,
    Ecdsa,
}

impl SigningMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SigningMethod::Hmac => "hmac",
            SigningMethod::Rsa => "rsa",
            SigningMethod::Ecdsa => "ecdsa",
        }
    }

    /// JWKS `kty` value for keys of this family.
    #[must_use]
    pub fn key_type(self) -> &'static str {
        match self {
            SigningMethod::Hmac => "oct",
            SigningMethod::Rsa => "RSA",
            SigningMethod::Ecdsa => "EC",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub api_id: String,
    pub org_id: String,
    #[serde(default)]
    pub name: String,
    /// Requests are matched to an API by longest listen-path prefix.
    pub listen_path: String,
    pub upstream_url: String,
    #[serde(default)]
    pub auth: AuthTokenConfig,
    /// `hmac` | `rsa` | `ecdsa`; anything else falls back to `hmac` with a
    /// warning at load time.
    #[serde(default = "default_signing_method")]
    pub signing_method: String,
    /// JWKS endpoint URL, or inline base64 key material. Empty means direct
    /// mode (per-key shared secrets).
    #[serde(default)]
    pub jwt_source: Option<String>,
    /// Claim naming the caller identity in central-authority mode.
    #[serde(default)]
    pub jwt_identity_base_field: Option<String>,
    /// Claim naming the policy to synthesize sessions from.
    #[serde(default)]
    pub jwt_policy_field_name: Option<String>,
}

impl ApiConfig {
    /// The normalized signing family. Unrecognized values were rewritten to
    /// `hmac` during load, so this never fails.
    #[must_use]
    pub fn signing_method(&self) -> SigningMethod {
        match self.signing_method.as_str() {
            "rsa" => SigningMethod::Rsa,
            "ecdsa" => SigningMethod::Ecdsa,
            _ => SigningMethod::Hmac,
        }
    }

    /// Non-empty `jwt_source`, if configured.
    #[must_use]
    pub fn jwt_source(&self) -> Option<&str> {
        self.jwt_source.as_deref().filter(|s| !s.is_empty())
    }

    /// Whether `jwt_source` points at a remote JWKS endpoint.
    #[must_use]
    pub fn jwt_source_is_url(&self) -> bool {
        self.jwt_source()
            .is_some_and(|s| s.starts_with("http://") || s.starts_with("https://"))
    }

    #[must_use]
    pub fn identity_base_field(&self) -> Option<&str> {
        self.jwt_identity_base_field
            .as_deref()
            .filter(|f| !f.is_empty())
    }

    #[must_use]
    pub fn policy_field_name(&self) -> Option<&str> {
        self.jwt_policy_field_name
            .as_deref()
            .filter(|f| !f.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Default store TTL for sessions that do not carry their own lifetime.
    #[serde(default = "default_session_lifetime")]
    pub session_lifetime_secs: u64,
    #[serde(default)]
    pub local_session_cache: LocalCacheConfig,
    #[serde(default)]
    pub jwks_cache: JwksCacheConfig,
    /// Trade read-after-write for latency on session counter writes.
    #[serde(default)]
    pub use_async_session_write: bool,
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Outbound HTTP timeout (JWKS fetches, upstream dispatch), seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub policies_path: Option<PathBuf>,
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
}

impl GatewayConfig {
    /// Load and validate a YAML config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the API
    /// list fails validation.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let mut config: GatewayConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate and normalize. Called by `from_file`; exposed for configs
    /// built in code.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate API ids, duplicate or malformed listen
    /// paths, or unparseable upstream URLs.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        let mut api_ids = HashSet::new();
        let mut listen_paths = HashSet::new();
        for api in &mut self.apis {
            anyhow::ensure!(!api.api_id.is_empty(), "api with empty api_id");
            anyhow::ensure!(
                api_ids.insert(api.api_id.clone()),
                "duplicate api_id '{}'",
                api.api_id
            );
            anyhow::ensure!(
                api.listen_path.starts_with('/'),
                "api '{}': listen_path must start with '/'",
                api.api_id
            );
            anyhow::ensure!(
                listen_paths.insert(api.listen_path.clone()),
                "duplicate listen_path '{}'",
                api.listen_path
            );
            reqwest::Url::parse(&api.upstream_url)
                .with_context(|| format!("api '{}': invalid upstream_url", api.api_id))?;

            if !matches!(api.signing_method.as_str(), "hmac" | "rsa" | "ecdsa") {
                warn!(
                    api_id = %api.api_id,
                    declared = %api.signing_method,
                    "unrecognized signing method, defaulting to hmac"
                );
                api.signing_method = "hmac".to_string();
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}
