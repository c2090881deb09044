//! LAN-direct WebSocket reconnection transport: `GET /ws/{device_id}`.
//!
//! The first binary frame in either direction is the auth handshake; every
//! frame after that carries the same command/event envelope the WebRTC
//! control channel does, fed straight to the connection manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{http::StatusCode, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;

use crate::connection_manager::{ConnectionCodec, ConnectionManager};
use crate::constants::{LAN_AUTH_FAILURE_CLOSE_CODE, RECONNECT_FRESHNESS_WINDOW};
use crate::crypto;
use crate::device::DeviceStore;
use crate::peer::{Peer, PeerOwner};

#[derive(Debug, Deserialize)]
struct LanDirectAuthRequest {
    device_id: String,
    timestamp: u64,
    signature_hex: String,
}

#[derive(Debug, Serialize)]
struct LanDirectAuthResponse {
    status: &'static str,
}

pub struct LanWsState {
    pub devices: Arc<tokio::sync::Mutex<DeviceStore>>,
    pub connections: Arc<ConnectionManager>,
    pub message_sink: crate::pairing::MessageSink,
}

pub fn router(state: Arc<LanWsState>) -> Router {
    Router::new().route("/ws/{device_id}", get(handle_upgrade)).with_state(state)
}

async fn handle_upgrade(
    State(state): State<Arc<LanWsState>>,
    Path(device_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let known = state.devices.lock().await.contains(&device_id);
    if !known {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, device_id, state))
}

async fn handle_socket(mut socket: WebSocket, device_id: String, state: Arc<LanWsState>) {
    let Some(Ok(Message::Binary(frame))) = socket.recv().await else {
        let _ = close_with(&mut socket, LAN_AUTH_FAILURE_CLOSE_CODE, "missing auth frame").await;
        return;
    };

    let Ok(auth) = serde_json::from_slice::<LanDirectAuthRequest>(&frame) else {
        let _ = close_with(&mut socket, LAN_AUTH_FAILURE_CLOSE_CODE, "malformed auth frame").await;
        return;
    };

    if auth.device_id != device_id {
        let _ = close_with(&mut socket, LAN_AUTH_FAILURE_CLOSE_CODE, "device id mismatch").await;
        return;
    }

    let now = now_unix();
    if now.abs_diff(auth.timestamp) > RECONNECT_FRESHNESS_WINDOW.as_secs() {
        let _ = close_with(&mut socket, LAN_AUTH_FAILURE_CLOSE_CODE, "stale timestamp").await;
        return;
    }

    let auth_key = {
        let devices = state.devices.lock().await;
        match devices.get(&device_id) {
            Some(device) => crypto::derive_key(&device.master_secret, "auth"),
            None => {
                let _ = close_with(&mut socket, LAN_AUTH_FAILURE_CLOSE_CODE, "unknown device").await;
                return;
            }
        }
    };

    let Ok(signature) = hex_decode(&auth.signature_hex) else {
        let _ = close_with(&mut socket, LAN_AUTH_FAILURE_CLOSE_CODE, "malformed signature").await;
        return;
    };

    let mut body = Vec::new();
    body.extend_from_slice(device_id.as_bytes());
    body.extend_from_slice(&auth.timestamp.to_be_bytes());
    if !crypto::verify_hmac_sha256(&auth_key, &body, &signature) {
        let _ = close_with(&mut socket, LAN_AUTH_FAILURE_CLOSE_CODE, "invalid signature").await;
        return;
    }

    let response = serde_json::to_vec(&LanDirectAuthResponse { status: "authenticated" }).unwrap_or_default();
    if socket.send(Message::Binary(response.into())).await.is_err() {
        return;
    }

    let peer: Arc<dyn Peer> = Arc::new(LanWsPeer::new(socket));
    let sink = Arc::clone(&state.message_sink);
    state
        .connections
        .add_connection(device_id.clone(), peer, ConnectionCodec::Json, move |id, bytes| sink(id, bytes))
        .await;
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) -> Result<(), axum::Error> {
    socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len()).step_by(2).map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ())).collect()
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Adapts an already-authenticated axum `WebSocket` to the [`Peer`] trait so
/// it can be handed to the connection manager alongside the WebRTC peer.
///
/// The inbound half is only drained once `on_message` is registered —
/// `add_connection` always registers it before the socket is used, so no
/// frame arrives before a reader is listening.
type CloseCallback = Arc<std::sync::Mutex<Option<Box<dyn Fn() + Send + Sync>>>>;

struct LanWsPeer {
    outbound: TokioMutex<Option<futures_util::stream::SplitSink<WebSocket, Message>>>,
    inbound: TokioMutex<Option<futures_util::stream::SplitStream<WebSocket>>>,
    on_close: CloseCallback,
    closed: AtomicBool,
}

impl LanWsPeer {
    fn new(socket: WebSocket) -> Self {
        let (outbound, inbound) = socket.split();
        Self {
            outbound: TokioMutex::new(Some(outbound)),
            inbound: TokioMutex::new(Some(inbound)),
            on_close: Arc::new(std::sync::Mutex::new(None)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Peer for LanWsPeer {
    async fn send(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.outbound.lock().await;
        match guard.as_mut() {
            Some(sink) => sink.send(Message::Binary(bytes.to_vec().into())).await.map_err(Into::into),
            None => anyhow::bail!("LAN websocket already closed"),
        }
    }

    fn close_by_owner(&self, _caller: PeerOwner) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn transfer_ownership(&self, _new_owner: PeerOwner) {}

    fn on_message(&self, cb: Box<dyn Fn(Vec<u8>) + Send + Sync>) {
        let Some(mut inbound) = self.inbound.try_lock().ok().and_then(|mut g| g.take()) else {
            return;
        };
        let on_close = Arc::clone(&self.on_close);
        tokio::spawn(async move {
            while let Some(Ok(message)) = inbound.next().await {
                if let Message::Binary(bytes) = message {
                    cb(bytes.to_vec());
                }
            }
            if let Some(cb) = on_close.lock().expect("lan ws close callback mutex poisoned").as_ref() {
                cb();
            }
        });
    }

    fn on_close(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.on_close.lock().expect("lan ws close callback mutex poisoned") = Some(cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_decode_round_trips() {
        let bytes = crypto::random_bytes(16);
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex_decode(&hex).unwrap(), bytes);
    }

    #[test]
    fn auth_body_concatenation_matches_hmac_contract() {
        let auth_key = [9u8; 32];
        let device_id = "dev-1";
        let timestamp = 1_700_000_000u64;
        let mut body = Vec::new();
        body.extend_from_slice(device_id.as_bytes());
        body.extend_from_slice(&timestamp.to_be_bytes());
        let sig = crypto::hmac_sha256(&auth_key, &body);
        assert!(crypto::verify_hmac_sha256(&auth_key, &body, &sig));
    }
}
