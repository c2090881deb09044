//! Data-channel auth handshake: four messages bounded by a 10s timeout.
//!
//! `AuthChallenge` (server→client) → `AuthResponse` (client→server) →
//! `AuthVerify` (server→client) → `AuthSuccess` (server→client, carries the
//! *daemon's* device id). Any failure sends a structured `AuthError` then
//! closes the connection.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::constants::PAIRING_AUTH_TIMEOUT;
use crate::crypto;
use crate::errors::AuthError;
use crate::peer::Peer;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMessage {
    AuthChallenge { nonce: HexBytes },
    AuthResponse { hmac: HexBytes, nonce: HexBytes },
    AuthVerify { hmac: HexBytes },
    AuthSuccess { device_id: String },
    AuthError { code: String },
}

/// Hex-encoded byte vector for JSON transport over the data channel.
pub type HexBytes = String;

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len()).step_by(2).map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok()).collect()
}

/// Drive the server side of the handshake over `peer`, reading inbound
/// messages from `inbound`. Returns the verified client nonce's HMAC
/// context is already consumed; callers only need the final outcome.
pub async fn run_server_handshake(
    peer: &Arc<dyn Peer>,
    inbound: &mut mpsc::Receiver<Vec<u8>>,
    auth_key: &[u8; 32],
    daemon_device_id: &str,
) -> Result<(), AuthError> {
    timeout(PAIRING_AUTH_TIMEOUT, run_server_handshake_inner(peer, inbound, auth_key, daemon_device_id))
        .await
        .map_err(|_| AuthError::Timeout)?
}

async fn run_server_handshake_inner(
    peer: &Arc<dyn Peer>,
    inbound: &mut mpsc::Receiver<Vec<u8>>,
    auth_key: &[u8; 32],
    daemon_device_id: &str,
) -> Result<(), AuthError> {
    let server_nonce = crypto::random_bytes(32);
    send(peer, &AuthMessage::AuthChallenge { nonce: to_hex(&server_nonce) }).await;

    let response = recv(inbound).await.ok_or(AuthError::ProtocolError)?;
    let AuthMessage::AuthResponse { hmac, nonce: client_nonce_hex } = response else {
        send_error(peer, AuthError::ProtocolError).await;
        return Err(AuthError::ProtocolError);
    };

    let client_nonce = from_hex(&client_nonce_hex).ok_or(AuthError::InvalidNonce)?;
    if client_nonce.len() != 32 {
        send_error(peer, AuthError::InvalidNonce).await;
        return Err(AuthError::InvalidNonce);
    }

    let expected_hmac = crypto::hmac_sha256(auth_key, &server_nonce);
    let given_hmac = from_hex(&hmac).ok_or(AuthError::InvalidHmac)?;
    if !crypto::verify_hmac_sha256(auth_key, &server_nonce, &given_hmac) {
        send_error(peer, AuthError::InvalidHmac).await;
        return Err(AuthError::InvalidHmac);
    }
    // keep the constant-time verify path as the sole arbiter; recomputing is
    // only for documentation here.
    let _ = expected_hmac;

    let verify_hmac = crypto::hmac_sha256(auth_key, &client_nonce);
    send(peer, &AuthMessage::AuthVerify { hmac: to_hex(&verify_hmac) }).await;
    send(peer, &AuthMessage::AuthSuccess { device_id: daemon_device_id.to_string() }).await;

    Ok(())
}

async fn send(peer: &Arc<dyn Peer>, message: &AuthMessage) {
    if let Ok(bytes) = serde_json::to_vec(message) {
        let _ = peer.send(&bytes).await;
    }
}

async fn send_error(peer: &Arc<dyn Peer>, error: AuthError) {
    send(peer, &AuthMessage::AuthError { code: error.code().to_string() }).await;
}

async fn recv(inbound: &mut mpsc::Receiver<Vec<u8>>) -> Option<AuthMessage> {
    let bytes = inbound.recv().await?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips() {
        let bytes = crypto::random_bytes(32);
        assert_eq!(from_hex(&to_hex(&bytes)).unwrap(), bytes);
    }
}
