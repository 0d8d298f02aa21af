//! JWT authentication middleware.
//!
//! Extracts the bearer credential, enforces the API's signing-method
//! family, obtains the verification key (JWKS endpoint, inline key
//! material, or the session's shared secret) and binds the resolved or
//! synthesized session into the request context.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::{Engine as _, engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation, decode, decode_header};
use md5::{Digest as _, Md5};
use std::sync::Arc;
use tracing::info;

use super::{bound_api, bound_context, chain_miswired, request_origin};
use crate::config::{ApiConfig, SigningMethod};
use crate::error::{AuthError, KeyRetrievalError};
use crate::events::{EventKind, encode_request_snapshot};
use crate::jwks::JwksKeyMaterial;
use crate::session::SessionState;
use crate::state::GatewayState;
use crate::store::unix_now;

const PEM_PREFIX: &[u8] = b"-----BEGIN";

pub struct AuthOutcome {
    pub session: SessionState,
    pub key_id: String,
}

pub async fn jwt_auth(
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

    let auth_result = match extract_credential(&api, &request) {
        Ok(token) => authenticate(&state, &api, token).await,
        Err(err) => Err(err),
    };

    match auth_result {
        Ok(outcome) => {
            ctx.bind_session(outcome.session, outcome.key_id);
            next.run(request).await
        }
        Err(err) => {
            let origin = request_origin(&request);
            info!(
                path = request.uri().path(),
                origin = %origin,
                api_id = %api.api_id,
                error = %err,
                "authentication failed"
            );
            state.health.record_key_failure();
            let snapshot = encode_request_snapshot(
                request.method(),
                request.uri(),
                &origin,
                request.headers(),
            );
            state.events.emit(
                EventKind::AuthFailed,
                None,
                request.uri().path(),
                &origin,
                snapshot,
            );
            err.into_response()
        }
    }
}

async fn authenticate(
    state: &Arc<GatewayState>,
    api: &Arc<ApiConfig>,
    token: String,
) -> Result<AuthOutcome, AuthError> {
    let header = decode_header(&token).map_err(AuthError::MalformedToken)?;
    check_signing_method(api, &header)?;

    if let Some(source) = api.jwt_source() {
        let decoding_key = if api.jwt_source_is_url() {
            // Central-authority tokens select their key by kid; a token
            // without one has no usable identity either.
            let kid = header.kid.as_deref().ok_or(AuthError::IdentityNotFound)?;
            let material = state
                .jwks
                .key_material(&api.api_id, source, kid, api.signing_method().key_type())
                .await?;
            key_from_jwks(api.signing_method(), &material)?
        } else {
            key_from_inline(api.signing_method(), source)?
        };
        let claims = verify(&token, &header, &decoding_key)?;
        central_authority_session(state, api, &claims).await
    } else {
        let identity = identity_from_token(&header, &token)?;
        let resolver = state.resolver_for(api);
        let session = resolver
            .check_session_and_identity(&identity)
            .await?
            .ok_or(AuthError::KeyNotAuthorized)?;
        let decoding_key = key_from_session_secret(api.signing_method(), &session.jwt_data.secret)?;
        verify(&token, &header, &decoding_key)?;
        Ok(AuthOutcome {
            session,
            key_id: identity,
        })
    }
}

/// Credential lookup in priority order: header, then query parameter, then
/// cookie, each gated by the API's auth config.
fn extract_credential(api: &ApiConfig, request: &Request) -> Result<String, AuthError> {
    let auth = &api.auth;

    if let Some(raw) = request
        .headers()
        .get(auth.header_name.as_str())
        .and_then(|v| v.to_str().ok())
    {
        let token = strip_bearer(raw);
        if !token.is_empty() {
            return Ok(token);
        }
    }

    if auth.use_param
        && let Some(query) = request.uri().query()
        && let Some(raw) = query_param(query, auth.param_name())
    {
        let token = strip_bearer(&raw);
        if !token.is_empty() {
            return Ok(token);
        }
    }

    if auth.use_cookie
        && let Some(raw) = cookie_value(request, auth.cookie_name())
    {
        let token = strip_bearer(&raw);
        if !token.is_empty() {
            return Ok(token);
        }
    }

    Err(AuthError::MissingAuth)
}

/// Strip a leading `Bearer ` prefix case-insensitively, plus surrounding
/// whitespace.
fn strip_bearer(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(prefix) = trimmed.get(..7)
        && prefix.eq_ignore_ascii_case("bearer ")
    {
        return trimmed[7..].trim().to_string();
    }
    trimmed.to_string()
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn cookie_value(request: &Request, name: &str) -> Option<String> {
    let raw = request
        .headers()
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    raw.split(';').find_map(|item| {
        let (key, value) = item.split_once('=')?;
        (key.trim() == name).then(|| value.trim().to_string())
    })
}

fn alg_family(alg: Algorithm) -> &'static str {
    match alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => "hmac",
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => "rsa",
        Algorithm::ES256 | Algorithm::ES384 => "ecdsa",
        Algorithm::EdDSA => "eddsa",
    }
}

fn check_signing_method(api: &ApiConfig, header: &Header) -> Result<(), AuthError> {
    let expected = api.signing_method().as_str();
    let got = alg_family(header.alg);
    if got != expected {
        return Err(AuthError::UnexpectedSigningMethod {
            expected,
            got: format!("{:?}", header.alg),
        });
    }
    Ok(())
}

/// Identity for direct mode: the `kid` header when present, otherwise the
/// (unverified) `sub` claim.
fn identity_from_token(header: &Header, token: &str) -> Result<String, AuthError> {
    if let Some(kid) = &header.kid
        && !kid.is_empty()
    {
        return Ok(kid.clone());
    }
    let claims = unverified_claims(token)?;
    claims
        .get("sub")
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(AuthError::IdentityNotFound)
}

/// Decode the payload segment without verifying the signature. Used only to
/// learn which session's secret to verify against; the signature check
/// happens right after.
fn unverified_claims(token: &str) -> Result<serde_json::Value, AuthError> {
    let malformed = || AuthError::MalformedToken(jsonwebtoken::errors::ErrorKind::InvalidToken.into());
    let payload = token.split('.').nth(1).ok_or_else(malformed)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|_| malformed())?;
    serde_json::from_slice(&bytes).map_err(|_| malformed())
}

fn key_from_jwks(
    method: SigningMethod,
    material: &JwksKeyMaterial,
) -> Result<DecodingKey, AuthError> {
    match method {
        SigningMethod::Rsa => {
            if let Some((n, e)) = &material.rsa_components {
                DecodingKey::from_rsa_components(n, e).map_err(|e| {
                    AuthError::KeyRetrievalFailed(KeyRetrievalError::KeyMaterial(e))
                })
            } else {
                Ok(DecodingKey::from_rsa_der(&material.certificate_der))
            }
        }
        SigningMethod::Ecdsa => Ok(DecodingKey::from_ec_der(&material.certificate_der)),
        SigningMethod::Hmac => Ok(DecodingKey::from_secret(&material.certificate_der)),
    }
}

/// A non-URL `jwt_source` is base64 of either PEM key material or the raw
/// key bytes.
fn key_from_inline(method: SigningMethod, source: &str) -> Result<DecodingKey, AuthError> {
    let bytes = STANDARD
        .decode(source)
        .map_err(|e| AuthError::KeyRetrievalFailed(KeyRetrievalError::KeyDecode(e)))?;
    let key_material_err =
        |e| AuthError::KeyRetrievalFailed(KeyRetrievalError::KeyMaterial(e));
    match method {
        SigningMethod::Hmac => Ok(DecodingKey::from_secret(&bytes)),
        SigningMethod::Rsa => {
            if bytes.starts_with(PEM_PREFIX) {
                DecodingKey::from_rsa_pem(&bytes).map_err(key_material_err)
            } else {
                Ok(DecodingKey::from_rsa_der(&bytes))
            }
        }
        SigningMethod::Ecdsa => {
            if bytes.starts_with(PEM_PREFIX) {
                DecodingKey::from_ec_pem(&bytes).map_err(key_material_err)
            } else {
                Ok(DecodingKey::from_ec_der(&bytes))
            }
        }
    }
}

fn key_from_session_secret(method: SigningMethod, secret: &str) -> Result<DecodingKey, AuthError> {
    let key_material_err =
        |e| AuthError::KeyRetrievalFailed(KeyRetrievalError::KeyMaterial(e));
    match method {
        SigningMethod::Hmac => Ok(DecodingKey::from_secret(secret.as_bytes())),
        SigningMethod::Rsa => DecodingKey::from_rsa_pem(secret.as_bytes()).map_err(key_material_err),
        SigningMethod::Ecdsa => DecodingKey::from_ec_pem(secret.as_bytes()).map_err(key_material_err),
    }
}

fn verify(
    token: &str,
    header: &Header,
    decoding_key: &DecodingKey,
) -> Result<serde_json::Value, AuthError> {
    let mut validation = Validation::new(header.alg);
    // Audience is not part of this gateway's contract.
    validation.validate_aud = false;
    let data = decode::<serde_json::Value>(token, decoding_key, &validation)
        .map_err(AuthError::MalformedToken)?;
    Ok(data.claims)
}

/// Resolve or synthesize the session for a verified central-authority token.
async fn central_authority_session(
    state: &Arc<GatewayState>,
    api: &Arc<ApiConfig>,
    claims: &serde_json::Value,
) -> Result<AuthOutcome, AuthError> {
    let base_field = api.identity_base_field().unwrap_or("sub");
    let base_value = claims
        .get(base_field)
        .and_then(serde_json::Value::as_str)
        .or_else(|| claims.get("sub").and_then(serde_json::Value::as_str))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::MissingIdentityClaim {
            claim: base_field.to_string(),
        })?;

    let session_id = synthetic_session_id(&api.org_id, base_value);

    let resolver = state.resolver_for(api);
    if let Some(session) = resolver.check_session_and_identity(&session_id).await? {
        return Ok(AuthOutcome {
            session,
            key_id: session_id,
        });
    }

    // First sight of this identity: derive a session from the policy the
    // token is signed for.
    let policy_field = api.policy_field_name().ok_or(AuthError::NoMatchingPolicy)?;
    let policy_id = claims
        .get(policy_field)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::NoMatchingPolicy)?;
    let policy = state
        .policies
        .get(policy_id)
        .ok_or(AuthError::NoMatchingPolicy)?;
    if policy.org_id != api.org_id {
        info!(
            policy_id,
            policy_org = %policy.org_id,
            api_org = %api.org_id,
            "refusing cross-org policy claim"
        );
        return Err(AuthError::NoMatchingPolicy);
    }

    let now = unix_now();
    let mut session = SessionState::default();
    policy.overlay_onto(&mut session);
    session.quota_remaining = policy.quota_max.max(0);
    session.quota_renews_at = now as i64 + policy.quota_renewal_rate.max(0);
    if let Some(expires_in) = policy.key_expires_in
        && expires_in > 0
    {
        session.key_expires_at = Some(now + expires_in);
    }

    state
        .session_store
        .update_session(
            &session_id,
            &session,
            session.lifetime(state.config.session_lifetime_secs),
        )
        .await?;

    Ok(AuthOutcome {
        session,
        key_id: session_id,
    })
}

/// Deterministic session ID for a central-authority identity:
/// `org_id + hex(md5(base field value))`.
#[must_use]
pub fn synthetic_session_id(org_id: &str, base_value: &str) -> String {
    format!("{org_id}{}", hex::encode(Md5::digest(base_value.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthTokenConfig;
    use axum::body::Body;
    use jsonwebtoken::EncodingKey;

    fn api_with_auth(auth: AuthTokenConfig) -> ApiConfig {
        ApiConfig {
            api_id: "a1".into(),
            org_id: "o1".into(),
            name: String::new(),
            listen_path: "/a1".into(),
            upstream_url: "http://127.0.0.1:1".into(),
            auth,
            signing_method: "hmac".into(),
            jwt_source: None,
            jwt_identity_base_field: None,
            jwt_policy_field_name: None,
        }
    }

    fn hs256_token(kid: Option<&str>, claims: serde_json::Value, secret: &str) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(str::to_string);
        jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .expect("encode token")
    }

    fn exp() -> u64 {
        unix_now() + 600
    }

    #[test]
    fn bearer_prefix_is_stripped_case_insensitively() {
        assert_eq!(strip_bearer("Bearer abc"), "abc");
        assert_eq!(strip_bearer("bEaReR   abc  "), "abc");
        assert_eq!(strip_bearer("  abc "), "abc");
        assert_eq!(strip_bearer("Bearer"), "Bearer");
    }

    #[test]
    fn header_wins_over_param_and_cookie() {
        let api = api_with_auth(AuthTokenConfig {
            use_param: true,
            use_cookie: true,
            ..AuthTokenConfig::default()
        });
        let request = Request::builder()
            .uri("/a1?Authorization=from-param")
            .header("Authorization", "Bearer from-header")
            .header("Cookie", "Authorization=from-cookie")
            .body(Body::empty())
            .expect("request");
        assert_eq!(
            extract_credential(&api, &request).expect("credential"),
            "from-header"
        );
    }

    #[test]
    fn param_and_cookie_are_opt_in() {
        let api = api_with_auth(AuthTokenConfig::default());
        let request = Request::builder()
            .uri("/a1?Authorization=from-param")
            .header("Cookie", "Authorization=from-cookie")
            .body(Body::empty())
            .expect("request");
        assert!(matches!(
            extract_credential(&api, &request),
            Err(AuthError::MissingAuth)
        ));

        let api = api_with_auth(AuthTokenConfig {
            use_param: true,
            ..AuthTokenConfig::default()
        });
        assert_eq!(
            extract_credential(&api, &request).expect("credential"),
            "from-param"
        );
    }

    #[test]
    fn empty_credential_is_missing_auth() {
        let api = api_with_auth(AuthTokenConfig::default());
        let request = Request::builder()
            .uri("/a1")
            .header("Authorization", "Bearer   ")
            .body(Body::empty())
            .expect("request");
        assert!(matches!(
            extract_credential(&api, &request),
            Err(AuthError::MissingAuth)
        ));
    }

    #[test]
    fn signing_method_gate_matches_families() {
        let api = api_with_auth(AuthTokenConfig::default());
        let hs = Header::new(Algorithm::HS256);
        assert!(check_signing_method(&api, &hs).is_ok());
        let rs = Header::new(Algorithm::RS256);
        assert!(matches!(
            check_signing_method(&api, &rs),
            Err(AuthError::UnexpectedSigningMethod { expected: "hmac", .. })
        ));
    }

    #[test]
    fn identity_prefers_kid_over_sub() {
        let token = hs256_token(
            Some("kid-1"),
            serde_json::json!({"sub": "sub-1", "exp": exp()}),
            "s",
        );
        let header = decode_header(&token).expect("header");
        assert_eq!(
            identity_from_token(&header, &token).expect("identity"),
            "kid-1"
        );

        let token = hs256_token(None, serde_json::json!({"sub": "sub-1", "exp": exp()}), "s");
        let header = decode_header(&token).expect("header");
        assert_eq!(
            identity_from_token(&header, &token).expect("identity"),
            "sub-1"
        );
    }

    #[test]
    fn no_kid_and_no_sub_is_identity_not_found() {
        let token = hs256_token(None, serde_json::json!({"exp": exp()}), "s");
        let header = decode_header(&token).expect("header");
        assert!(matches!(
            identity_from_token(&header, &token),
            Err(AuthError::IdentityNotFound)
        ));
    }

    #[test]
    fn verify_accepts_good_and_rejects_bad_signatures() {
        let token = hs256_token(None, serde_json::json!({"sub": "x", "exp": exp()}), "right");
        let header = decode_header(&token).expect("header");
        assert!(verify(&token, &header, &DecodingKey::from_secret(b"right")).is_ok());
        assert!(matches!(
            verify(&token, &header, &DecodingKey::from_secret(b"wrong")),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn synthetic_session_ids_are_deterministic() {
        // Known md5("a@x"), spelled out so the convention can't drift.
        assert_eq!(
            synthetic_session_id("O1", "a@x"),
            "O14895b1d4ed83c6da448e89f72e1103a0"
        );
        assert_ne!(
            synthetic_session_id("O1", "a@x"),
            synthetic_session_id("O2", "a@x")
        );
    }

    #[test]
    fn inline_hmac_source_decodes_to_secret() {
        let source = STANDARD.encode("topsecret");
        assert!(key_from_inline(SigningMethod::Hmac, &source).is_ok());
        assert!(matches!(
            key_from_inline(SigningMethod::Hmac, "!!not-base64!!"),
            Err(AuthError::KeyRetrievalFailed(_))
        ));
    }
}
