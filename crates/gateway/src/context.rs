//! Per-request context bag.
//!
//! The context is the single channel by which authentication state reaches
//! rate limiting, which fixes the middleware order: jwt auth runs before
//! limits. It rides in the request's extensions and is dropped with the
//! request.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::session::SessionState;

/// Closed set of context slots. New slots are a contract change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContextKey {
    SessionData = 0,
    AuthHeaderValue = 1,
    VersionData = 2,
    VersionKeyContext = 3,
}

#[derive(Debug, Clone)]
pub enum ContextValue {
    Session(Box<SessionState>),
    Text(String),
}

#[derive(Clone, Default)]
pub struct RequestContext {
    inner: Arc<Mutex<HashMap<ContextKey, ContextValue>>>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: ContextKey, value: ContextValue) {
        self.inner.lock().insert(key, value);
    }

    #[must_use]
    pub fn get(&self, key: ContextKey) -> Option<ContextValue> {
        self.inner.lock().get(&key).cloned()
    }

    /// The session bound by the auth middleware, if any.
    #[must_use]
    pub fn session(&self) -> Option<SessionState> {
        match self.get(ContextKey::SessionData) {
            Some(ContextValue::Session(s)) => Some(*s),
            _ => None,
        }
    }

    /// The resolved auth key ID bound by the auth middleware, if any.
    #[must_use]
    pub fn auth_key(&self) -> Option<String> {
        match self.get(ContextKey::AuthHeaderValue) {
            Some(ContextValue::Text(t)) => Some(t),
            _ => None,
        }
    }

    pub fn bind_session(&self, session: SessionState, auth_key: String) {
        self.set(
            ContextKey::SessionData,
            ContextValue::Session(Box::new(session)),
        );
        self.set(ContextKey::AuthHeaderValue, ContextValue::Text(auth_key));
    }
}
