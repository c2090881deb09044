//! Decrypt → validate → route. Two modes: pairing (bound to a session id
//! minted by the QR flow) and reconnection (bound to one already-paired
//! device's own session id and signaling key, re-derived from its persisted
//! master secret). All failures are silent — no response is ever sent for a
//! decryption, parse, validation, lookup, or peer-creation failure. That
//! silence is a hard security property, not an oversight.

use std::sync::Arc;

use async_trait::async_trait;

use crate::crypto::{self, MasterSecret};
use crate::device::DeviceStore;
use crate::peer::{Peer, PeerOwner};
use crate::signaling::envelope::{PairRequestPayload, PairResponsePayload, SignalEnvelope};
use crate::signaling::validator::{self, ExpectedContext, NonceCache};

/// Collaborator hooks invoked once validation passes. Kept as a trait so
/// tests can supply fakes instead of a real `rustrtc` peer connection.
#[async_trait]
pub trait SignalingCallbacks: Send + Sync {
    /// Create a peer from an offer SDP and return the answer SDP plus the
    /// peer, now owned by [`PeerOwner::SignalingHandler`].
    async fn accept_offer(&self, offer_sdp: &str) -> anyhow::Result<(String, Arc<dyn Peer>)>;

    /// Hand off a newly authenticated peer once the caller has taken
    /// ownership (pairing coordinator for pairing mode, connection manager
    /// for reconnection mode).
    async fn on_peer_created(&self, device_id: &str, device_name: &str, peer: Arc<dyn Peer>);

    /// Complete a credential-only pairing exchange for a `PAIR_REQUEST`.
    /// Only the pairing coordinator implements this for real; reconnection
    /// callbacks inherit the default, which refuses every request.
    async fn accept_pair_request(&self, _request: &PairRequestPayload) -> Option<PairResponsePayload> {
        None
    }

    fn local_capabilities(&self) -> Vec<String>;
}

pub enum Mode {
    Pairing {
        session_id: String,
        signaling_key: MasterSecret,
    },
    Reconnection {
        session_id: String,
        device_id: String,
        signaling_key: MasterSecret,
        devices: Arc<tokio::sync::Mutex<DeviceStore>>,
    },
}

pub struct SignalingHandler<C: SignalingCallbacks> {
    mode: Mode,
    nonce_cache: NonceCache,
    callbacks: C,
}

impl<C: SignalingCallbacks> SignalingHandler<C> {
    pub fn new(mode: Mode, callbacks: C) -> Self {
        Self {
            mode,
            nonce_cache: NonceCache::new(),
            callbacks,
        }
    }

    /// Decrypt, validate and route `ciphertext_b64`. Returns the base64
    /// ciphertext to publish in response, or `None` on any failure — the
    /// caller must never distinguish the failure reason on the wire.
    pub async fn handle(&self, ciphertext_b64: &str) -> Option<String> {
        let signaling_key = self.signaling_key_for_decrypt();
        let plaintext = crypto::decrypt_base64(&signaling_key, ciphertext_b64).ok()?;
        let envelope: SignalEnvelope = serde_json::from_slice(&plaintext).ok()?;

        let expected_type = match &envelope {
            SignalEnvelope::Offer(_) => "OFFER",
            SignalEnvelope::Capabilities(_) => "CAPABILITIES",
            SignalEnvelope::PairRequest(_) => "PAIR_REQUEST",
            _ => return None,
        };

        let expected_session_id = match &self.mode {
            Mode::Pairing { session_id, .. } | Mode::Reconnection { session_id, .. } => session_id.as_str(),
        };

        validator::validate(
            &envelope,
            &ExpectedContext { session_id: Some(expected_session_id), expected_type },
            &self.nonce_cache,
        )
        .ok()?;

        if let Mode::Reconnection { device_id, devices, .. } = &self.mode {
            if let SignalEnvelope::Offer(offer) = &envelope {
                if &offer.device_id != device_id {
                    return None;
                }
            }
            if !devices.lock().await.contains(device_id) {
                return None;
            }
        }

        match envelope {
            SignalEnvelope::Offer(offer) => self.handle_offer(offer, &signaling_key).await,
            SignalEnvelope::Capabilities(caps) => self.handle_capabilities(caps, &signaling_key).await,
            SignalEnvelope::PairRequest(request) => self.handle_pair_request(request, &signaling_key).await,
            _ => None,
        }
    }

    fn signaling_key_for_decrypt(&self) -> MasterSecret {
        match &self.mode {
            Mode::Pairing { signaling_key, .. } | Mode::Reconnection { signaling_key, .. } => *signaling_key,
        }
    }

    async fn handle_offer(
        &self,
        offer: crate::signaling::envelope::OfferPayload,
        signaling_key: &MasterSecret,
    ) -> Option<String> {
        let (answer_sdp, peer) = self.callbacks.accept_offer(&offer.sdp).await.ok()?;
        peer.transfer_ownership(PeerOwner::SignalingHandler);

        let answer = crate::signaling::envelope::AnswerPayload {
            session_id: offer.session_id.clone(),
            sdp: answer_sdp,
            timestamp: now_unix(),
            nonce: crypto::random_bytes(16),
        };
        let response = serde_json::to_vec(&SignalEnvelope::Answer(answer)).ok()?;
        let encrypted = crypto::encrypt_base64(signaling_key, &response);

        self.callbacks.on_peer_created(&offer.device_id, &offer.device_name, peer).await;
        Some(encrypted)
    }

    async fn handle_capabilities(
        &self,
        caps: crate::signaling::envelope::CapabilitiesPayload,
        signaling_key: &MasterSecret,
    ) -> Option<String> {
        let response = crate::signaling::envelope::CapabilitiesPayload {
            session_id: caps.session_id,
            timestamp: now_unix(),
            nonce: crypto::random_bytes(16),
            capabilities: self.callbacks.local_capabilities(),
        };
        let body = serde_json::to_vec(&SignalEnvelope::Capabilities(response)).ok()?;
        Some(crypto::encrypt_base64(signaling_key, &body))
    }

    async fn handle_pair_request(&self, request: PairRequestPayload, signaling_key: &MasterSecret) -> Option<String> {
        let response = self.callbacks.accept_pair_request(&request).await?;
        let body = serde_json::to_vec(&SignalEnvelope::PairResponse(response)).ok()?;
        Some(crypto::encrypt_base64(signaling_key, &body))
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerOwner;

    struct FakePeer;
    #[async_trait]
    impl Peer for FakePeer {
        async fn send(&self, _bytes: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        fn close_by_owner(&self, _caller: PeerOwner) {}
        fn transfer_ownership(&self, _new_owner: PeerOwner) {}
        fn on_message(&self, _cb: Box<dyn Fn(Vec<u8>) + Send + Sync>) {}
        fn on_close(&self, _cb: Box<dyn Fn() + Send + Sync>) {}
    }

    struct FakeCallbacks;
    #[async_trait]
    impl SignalingCallbacks for FakeCallbacks {
        async fn accept_offer(&self, _offer_sdp: &str) -> anyhow::Result<(String, Arc<dyn Peer>)> {
            Ok(("v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n".to_string(), Arc::new(FakePeer)))
        }
        async fn on_peer_created(&self, _device_id: &str, _device_name: &str, _peer: Arc<dyn Peer>) {}
        fn local_capabilities(&self) -> Vec<String> {
            vec!["terminal".into()]
        }
    }

    fn make_offer_ciphertext(key: &MasterSecret, session_id: &str) -> String {
        let offer = crate::signaling::envelope::OfferPayload {
            session_id: session_id.to_string(),
            sdp: "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n".to_string(),
            device_id: "mock-device-123".to_string(),
            device_name: "Mock Android Phone".to_string(),
            timestamp: now_unix(),
            nonce: crypto::random_bytes(16),
            capabilities: vec![],
        };
        let body = serde_json::to_vec(&SignalEnvelope::Offer(offer)).unwrap();
        crypto::encrypt_base64(key, &body)
    }

    #[tokio::test]
    async fn accepts_valid_offer_and_returns_answer() {
        let key = [7u8; 32];
        let handler = SignalingHandler::new(
            Mode::Pairing { session_id: "sess123".into(), signaling_key: key },
            FakeCallbacks,
        );
        let ciphertext = make_offer_ciphertext(&key, "sess123");
        assert!(handler.handle(&ciphertext).await.is_some());
    }

    #[tokio::test]
    async fn replayed_ciphertext_produces_no_second_answer() {
        let key = [7u8; 32];
        let handler = SignalingHandler::new(
            Mode::Pairing { session_id: "sess123".into(), signaling_key: key },
            FakeCallbacks,
        );
        let ciphertext = make_offer_ciphertext(&key, "sess123");
        assert!(handler.handle(&ciphertext).await.is_some());
        assert!(handler.handle(&ciphertext).await.is_none());
    }

    #[tokio::test]
    async fn wrong_session_id_is_dropped_silently() {
        let key = [7u8; 32];
        let handler = SignalingHandler::new(
            Mode::Pairing { session_id: "sess123".into(), signaling_key: key },
            FakeCallbacks,
        );
        let ciphertext = make_offer_ciphertext(&key, "other-session");
        assert!(handler.handle(&ciphertext).await.is_none());
    }

    fn temp_device_store() -> Arc<tokio::sync::Mutex<DeviceStore>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::mem::forget(dir);
        Arc::new(tokio::sync::Mutex::new(DeviceStore::load(path).unwrap()))
    }

    #[tokio::test]
    async fn accepts_offer_in_reconnection_mode_for_the_bound_device() {
        let key = [7u8; 32];
        let devices = temp_device_store();
        devices
            .lock()
            .await
            .upsert(crate::device::new_paired_device("mock-device-123".into(), "Mock Android Phone".into(), key))
            .unwrap();

        let handler = SignalingHandler::new(
            Mode::Reconnection { session_id: "sess123".into(), device_id: "mock-device-123".into(), signaling_key: key, devices },
            FakeCallbacks,
        );
        let ciphertext = make_offer_ciphertext(&key, "sess123");
        assert!(handler.handle(&ciphertext).await.is_some());
    }

    #[tokio::test]
    async fn reconnection_mode_rejects_offer_from_a_different_device() {
        let key = [7u8; 32];
        let devices = temp_device_store();
        devices
            .lock()
            .await
            .upsert(crate::device::new_paired_device("some-other-device".into(), "Other".into(), key))
            .unwrap();

        let handler = SignalingHandler::new(
            Mode::Reconnection { session_id: "sess123".into(), device_id: "some-other-device".into(), signaling_key: key, devices },
            FakeCallbacks,
        );
        let ciphertext = make_offer_ciphertext(&key, "sess123");
        assert!(handler.handle(&ciphertext).await.is_none());
    }

    #[tokio::test]
    async fn reconnection_mode_rejects_an_unpaired_device() {
        let key = [7u8; 32];
        let devices = temp_device_store();

        let handler = SignalingHandler::new(
            Mode::Reconnection { session_id: "sess123".into(), device_id: "mock-device-123".into(), signaling_key: key, devices },
            FakeCallbacks,
        );
        let ciphertext = make_offer_ciphertext(&key, "sess123");
        assert!(handler.handle(&ciphertext).await.is_none());
    }

    struct PairingFakeCallbacks;
    #[async_trait]
    impl SignalingCallbacks for PairingFakeCallbacks {
        async fn accept_offer(&self, _offer_sdp: &str) -> anyhow::Result<(String, Arc<dyn Peer>)> {
            anyhow::bail!("not used in this test")
        }
        async fn on_peer_created(&self, _device_id: &str, _device_name: &str, _peer: Arc<dyn Peer>) {}
        async fn accept_pair_request(&self, request: &PairRequestPayload) -> Option<PairResponsePayload> {
            Some(PairResponsePayload {
                session_id: request.session_id.clone(),
                daemon_device_id: "daemon-1".into(),
                hostname: "my-host".into(),
                timestamp: now_unix(),
                nonce: crypto::random_bytes(16),
                auth_proof: vec![0u8; 32],
            })
        }
        fn local_capabilities(&self) -> Vec<String> {
            vec![]
        }
    }

    #[tokio::test]
    async fn pair_request_routes_to_callbacks_and_returns_a_response() {
        let key = [7u8; 32];
        let handler = SignalingHandler::new(
            Mode::Pairing { session_id: "sess123".into(), signaling_key: key },
            PairingFakeCallbacks,
        );

        let request = PairRequestPayload {
            session_id: "sess123".into(),
            device_id: "mock-device-123".into(),
            device_name: "Mock Android Phone".into(),
            timestamp: now_unix(),
            nonce: crypto::random_bytes(16),
            auth_proof: vec![1u8; 32],
        };
        let body = serde_json::to_vec(&SignalEnvelope::PairRequest(request)).unwrap();
        let ciphertext = crypto::encrypt_base64(&key, &body);

        assert!(handler.handle(&ciphertext).await.is_some());
    }

    #[tokio::test]
    async fn pair_request_dropped_when_callbacks_refuse_it() {
        let key = [7u8; 32];
        let handler = SignalingHandler::new(
            Mode::Pairing { session_id: "sess123".into(), signaling_key: key },
            FakeCallbacks,
        );

        let request = PairRequestPayload {
            session_id: "sess123".into(),
            device_id: "mock-device-123".into(),
            device_name: "Mock Android Phone".into(),
            timestamp: now_unix(),
            nonce: crypto::random_bytes(16),
            auth_proof: vec![1u8; 32],
        };
        let body = serde_json::to_vec(&SignalEnvelope::PairRequest(request)).unwrap();
        let ciphertext = crypto::encrypt_base64(&key, &body);

        assert!(handler.handle(&ciphertext).await.is_none());
    }
}
