//! Error types for the auth/session/limits path.
//!
//! Everything that can terminate the middleware chain maps to an HTTP status
//! plus a short public reason; underlying causes stay in the logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::jwks::JwksError;

/// A failure while obtaining or decoding verification key material.
#[derive(Debug, Error)]
pub enum KeyRetrievalError {
    #[error(transparent)]
    Jwks(JwksError),

    #[error("failed to base64-decode inline key material: {0}")]
    KeyDecode(#[from] base64::DecodeError),

    #[error("failed to build verification key: {0}")]
    KeyMaterial(#[from] jsonwebtoken::errors::Error),
}

/// Everything that can reject a request before it reaches the upstream.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization field missing")]
    MissingAuth,

    #[error("malformed or unverifiable token: {0}")]
    MalformedToken(#[source] jsonwebtoken::errors::Error),

    #[error("unexpected signing method: api declares {expected}, token uses {got}")]
    UnexpectedSigningMethod { expected: &'static str, got: String },

    #[error("key retrieval failed: {0}")]
    KeyRetrievalFailed(#[source] KeyRetrievalError),

    #[error("no jwk matches the token kid")]
    NoMatchingKid,

    #[error("matching jwk has no certificate")]
    NoCertificate,

    #[error("token carries neither kid nor sub")]
    IdentityNotFound,

    #[error("key not authorized")]
    KeyNotAuthorized,

    #[error("token is missing the identity base claim '{claim}'")]
    MissingIdentityClaim { claim: String },

    #[error("no matching policy for token")]
    NoMatchingPolicy,

    #[error("rate limit exceeded")]
    RateExceeded,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("access denied")]
    AccessDenied,

    #[error("session store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl From<JwksError> for AuthError {
    fn from(err: JwksError) -> Self {
        match err {
            JwksError::NoMatchingKid => AuthError::NoMatchingKid,
            JwksError::NoCertificate => AuthError::NoCertificate,
            other => AuthError::KeyRetrievalFailed(KeyRetrievalError::Jwks(other)),
        }
    }
}

impl AuthError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingAuth => StatusCode::BAD_REQUEST,
            AuthError::RateExceeded => StatusCode::TOO_MANY_REQUESTS,
            AuthError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::MalformedToken(_)
            | AuthError::UnexpectedSigningMethod { .. }
            | AuthError::KeyRetrievalFailed(_)
            | AuthError::NoMatchingKid
            | AuthError::NoCertificate
            | AuthError::IdentityNotFound
            | AuthError::KeyNotAuthorized
            | AuthError::MissingIdentityClaim { .. }
            | AuthError::NoMatchingPolicy
            | AuthError::QuotaExceeded
            | AuthError::AccessDenied => StatusCode::FORBIDDEN,
        }
    }

    /// Short reason returned to the caller. Internal causes never leak here.
    #[must_use]
    pub fn public_reason(&self) -> &'static str {
        match self {
            AuthError::MissingAuth => "Authorization field missing",
            AuthError::MalformedToken(_) => "Key not authorized",
            AuthError::UnexpectedSigningMethod { .. } => "Key not authorized",
            AuthError::KeyRetrievalFailed(_)
            | AuthError::NoMatchingKid
            | AuthError::NoCertificate => "Key not authorized",
            AuthError::IdentityNotFound => "Key not authorized",
            AuthError::KeyNotAuthorized => "Key not authorized",
            AuthError::MissingIdentityClaim { .. } => "Key not authorized",
            AuthError::NoMatchingPolicy => "Key not authorized: no matching policy",
            AuthError::RateExceeded => "Rate limit exceeded",
            AuthError::QuotaExceeded => "Quota exceeded",
            AuthError::AccessDenied => "Access denied",
            AuthError::StoreUnavailable(_) => "Temporarily unavailable",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status(), self.public_reason()).into_response()
    }
}

/// Failures of the backing session store.
///
/// The in-memory store never produces these; networked implementations do.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("stored session did not deserialize: {0}")]
    Serialization(#[from] serde_json::Error),
}
