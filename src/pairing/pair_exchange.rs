//! Credential-only pair exchange: an alternative to the data-channel auth
//! handshake that skips peer-to-peer negotiation entirely. Used when the
//! client sends `PAIR_REQUEST` directly over the relay.

use crate::crypto::{self, MasterSecret};
use crate::device::{new_paired_device, DeviceStore, PairedDevice};
use crate::signaling::envelope::{PairRequestPayload, PairResponsePayload};

/// Verify the request proof, persist the device, and build the response
/// envelope. Returns `None` on proof mismatch — the caller must treat that
/// as a silent drop, same as any other signaling validation failure.
pub fn complete_pair_exchange(
    request: &PairRequestPayload,
    master_secret: &MasterSecret,
    auth_key: &[u8; 32],
    daemon_device_id: &str,
    hostname: &str,
    devices: &mut DeviceStore,
) -> Option<(PairedDevice, PairResponsePayload)> {
    let expected_proof = crypto::pair_request_proof(auth_key, &request.session_id, &request.device_id, &request.nonce);
    if expected_proof.len() != request.auth_proof.len()
        || !constant_time_eq(&expected_proof, &request.auth_proof)
    {
        return None;
    }

    let device = new_paired_device(request.device_id.clone(), request.device_name.clone(), *master_secret);
    devices.upsert(device.clone()).ok()?;

    let response_proof = crypto::pair_response_proof(auth_key, &request.nonce);
    let response = PairResponsePayload {
        session_id: request.session_id.clone(),
        daemon_device_id: daemon_device_id.to_string(),
        hostname: hostname.to_string(),
        timestamp: crate::pairing::session::now_unix(),
        nonce: crypto::random_bytes(16),
        auth_proof: response_proof,
    };

    Some((device, response))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_store() -> DeviceStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::mem::forget(dir);
        DeviceStore::load(PathBuf::from(path)).unwrap()
    }

    #[test]
    fn valid_proof_persists_device_and_builds_response() {
        let master_secret = [5u8; 32];
        let auth_key = crypto::derive_key(&master_secret, "auth");
        let nonce = crypto::random_bytes(32);
        let proof = crypto::pair_request_proof(&auth_key, "sess-1", "phone-1", &nonce);

        let request = PairRequestPayload {
            session_id: "sess-1".into(),
            device_id: "phone-1".into(),
            device_name: "Pixel".into(),
            timestamp: crate::pairing::session::now_unix(),
            nonce,
            auth_proof: proof,
        };

        let mut devices = temp_store();
        let result = complete_pair_exchange(&request, &master_secret, &auth_key, "daemon-1", "my-host", &mut devices);
        assert!(result.is_some());
        assert!(devices.contains("phone-1"));
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let master_secret = [5u8; 32];
        let auth_key = crypto::derive_key(&master_secret, "auth");
        let nonce = crypto::random_bytes(32);
        let mut proof = crypto::pair_request_proof(&auth_key, "sess-1", "phone-1", &nonce);
        proof[0] ^= 1;

        let request = PairRequestPayload {
            session_id: "sess-1".into(),
            device_id: "phone-1".into(),
            device_name: "Pixel".into(),
            timestamp: crate::pairing::session::now_unix(),
            nonce,
            auth_proof: proof,
        };

        let mut devices = temp_store();
        let result = complete_pair_exchange(&request, &master_secret, &auth_key, "daemon-1", "my-host", &mut devices);
        assert!(result.is_none());
        assert!(!devices.contains("phone-1"));
    }
}
