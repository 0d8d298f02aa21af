//! Gateway event bus.
//!
//! Violations on the auth/limits path publish events over a broadcast
//! channel; delivery is best-effort and never blocks the request. Each event
//! carries a base64-encoded JSON snapshot of the offending request.

use axum::http::{HeaderMap, Method, Uri, header};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

const EVENT_BUFFER: usize = 256;

/// Headers worth keeping in a snapshot. Credentials are deliberately not
/// among them.
const SNAPSHOT_HEADERS: [header::HeaderName; 3] = [
    header::HOST,
    header::USER_AGENT,
    header::CONTENT_TYPE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AuthFailed,
    RateLimitExceeded,
    QuotaExceeded,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event_id: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub path: String,
    pub origin: String,
    /// Base64-encoded JSON `RequestSnapshot`.
    pub snapshot: String,
}

#[derive(Debug, Serialize)]
struct RequestSnapshot<'a> {
    method: &'a str,
    path: &'a str,
    origin: &'a str,
    headers: Vec<(&'a str, String)>,
}

/// Encode the parts of a request that are safe to ship with an event.
#[must_use]
pub fn encode_request_snapshot(
    method: &Method,
    uri: &Uri,
    origin: &str,
    headers: &HeaderMap,
) -> String {
    let kept = SNAPSHOT_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.as_str(), v.to_string()))
        })
        .collect();
    let snapshot = RequestSnapshot {
        method: method.as_str(),
        path: uri.path(),
        origin,
        headers: kept,
    };
    let json = serde_json::to_vec(&snapshot).unwrap_or_default();
    STANDARD.encode(json)
}

pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, kind: EventKind, key: Option<String>, path: &str, origin: &str, snapshot: String) {
        let event = GatewayEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            key,
            path: path.to_string(),
            origin: origin.to_string(),
            snapshot,
        };
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Log every published event until `shutdown` is cancelled.
    pub fn spawn_logger(&self, shutdown: CancellationToken) {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(event) => info!(
                            kind = ?event.kind,
                            key = event.key.as_deref().unwrap_or("-"),
                            path = %event.path,
                            origin = %event.origin,
                            "gateway event"
                        ),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event logger lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }
}
