//! The single direct-HTTP signaling endpoint: `POST /signal/{session_id}`.
//!
//! Consolidates what the source kept as two parallel endpoints (one under
//! the pairing coordinator, one under a unified server) into exactly one, as
//! called for by the open design question: one router, one rate limiter,
//! one set of error codes.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::constants::{
    HTTP_SIGNAL_IP_RATE_LIMIT, HTTP_SIGNAL_RATE_WINDOW, HTTP_SIGNAL_SESSION_RATE_LIMIT, SIGNALING_FRESHNESS_WINDOW,
};
use crate::crypto;
use crate::errors::SignalingError;
use crate::peer::Peer;
use async_trait::async_trait;

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub sdp_offer: String,
    pub device_id: String,
    pub device_name: String,
}

#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub sdp_answer: String,
}

#[derive(Debug, Serialize)]
pub struct SignalErrorBody {
    pub code: &'static str,
}

/// Collaborator the HTTP handler delegates offer acceptance to; the real
/// implementation wraps a pairing session's peer creation and key lookup.
#[async_trait]
pub trait HttpSignalBackend: Send + Sync {
    /// Look up the signaling key and current state for `session_id`.
    /// Returns `None` if the session is unknown, expired, or in the wrong state.
    async fn session_key(&self, session_id: &str) -> Option<[u8; 32]>;

    async fn accept_offer(&self, session_id: &str, request: SignalRequest) -> anyhow::Result<(String, Arc<dyn Peer>)>;
}

struct RateLimiter {
    window: Duration,
    limit: u32,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    fn new(limit: u32, window: Duration) -> Self {
        Self { window, limit, hits: Mutex::new(HashMap::new()) }
    }

    fn check(&self, key: &str) -> bool {
        let mut hits = self.hits.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        let entry = hits.entry(key.to_string()).or_default();
        while let Some(&front) = entry.front() {
            if now.duration_since(front) > self.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() as u32 >= self.limit {
            return false;
        }
        entry.push_back(now);
        true
    }
}

pub struct AppState {
    backend: Arc<dyn HttpSignalBackend>,
    session_limiter: RateLimiter,
    ip_limiter: RateLimiter,
}

/// Build the router exposing `POST /signal/{session_id}` and `GET /health`.
pub fn router(backend: Arc<dyn HttpSignalBackend>) -> Router {
    let state = Arc::new(AppState {
        backend,
        session_limiter: RateLimiter::new(HTTP_SIGNAL_SESSION_RATE_LIMIT, HTTP_SIGNAL_RATE_WINDOW),
        ip_limiter: RateLimiter::new(HTTP_SIGNAL_IP_RATE_LIMIT, HTTP_SIGNAL_RATE_WINDOW),
    });

    Router::new()
        .route("/signal/{session_id}", post(handle_signal))
        .route("/health", get(|| async { StatusCode::OK }))
        .with_state(state)
}

async fn handle_signal(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<SignalRequest>,
) -> impl IntoResponse {
    if !state.ip_limiter.check(&remote.ip().to_string()) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, SignalingError::RateLimited);
    }
    if !state.session_limiter.check(&session_id) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, SignalingError::RateLimited);
    }

    let Some(key) = state.backend.session_key(&session_id).await else {
        return error_response(StatusCode::BAD_REQUEST, SignalingError::InvalidSession);
    };

    let Some(timestamp) = headers.get("X-RAS-Timestamp").and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<u64>().ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, SignalingError::InvalidRequest);
    };
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    if now.abs_diff(timestamp) > SIGNALING_FRESHNESS_WINDOW.as_secs() {
        return error_response(StatusCode::BAD_REQUEST, SignalingError::AuthenticationFailed);
    }

    let Some(signature_hex) = headers.get("X-RAS-Signature").and_then(|v| v.to_str().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, SignalingError::InvalidRequest);
    };
    let Ok(signature) = hex_decode(signature_hex) else {
        return error_response(StatusCode::BAD_REQUEST, SignalingError::InvalidRequest);
    };

    let body = format!("{}{}{}", request.sdp_offer, request.device_id, request.device_name);
    if !crypto::verify_signaling_hmac(&key, &session_id, timestamp, body.as_bytes(), &signature) {
        return error_response(StatusCode::BAD_REQUEST, SignalingError::AuthenticationFailed);
    }

    match state.backend.accept_offer(&session_id, request).await {
        Ok((answer_sdp, peer)) => {
            peer.transfer_ownership(crate::peer::PeerOwner::PairingSession);
            (StatusCode::OK, Json(SignalResponse { sdp_answer: answer_sdp })).into_response()
        }
        Err(e) => {
            log::warn!("direct HTTP signaling offer rejected for session {session_id}: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, SignalingError::InternalError)
        }
    }
}

fn error_response(status: StatusCode, error: SignalingError) -> axum::response::Response {
    (status, Json(SignalErrorBody { code: error.code() })).into_response()
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len()).step_by(2).map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_blocks_after_limit() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn hex_decode_round_trips() {
        let bytes = crypto::random_bytes(32);
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex_decode(&hex).unwrap(), bytes);
    }
}
