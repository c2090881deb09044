//! Pairing coordinator: QR issuance, the pairing-session state machine, the
//! direct-HTTP signaling endpoint, the auth-handshake driver, and the
//! pair-credential exchange.

pub mod auth_handshake;
pub mod http_signal;
pub mod pair_exchange;
pub mod qr;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::connection_manager::{ConnectionCodec, ConnectionManager};
use crate::crypto::{self, MasterSecret};
use crate::device::DeviceStore;
use crate::peer::{Peer, PeerOwner, WebRtcPeer};
use crate::signaling::envelope::{PairRequestPayload, PairResponsePayload};
use crate::signaling::{Mode as SignalingMode, RelayClient, SignalingCallbacks, SignalingHandler};
use session::{PairingSession, PairingState};

/// The daemon's own hostname, used as `PairResponsePayload.hostname`. Falls
/// back to the daemon device id if the OS won't hand back a valid hostname.
fn local_hostname(fallback: &str) -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Callback invoked once a pairing finalizes successfully.
pub type OnPairingComplete = Arc<dyn Fn(String, String) + Send + Sync>;
/// Sink the connection manager feeds every inbound control-channel message
/// to once a device has been handed off to it; wired to the dispatcher.
pub type MessageSink = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

pub struct PairingCoordinator {
    sessions: Mutex<HashMap<String, PairingSession>>,
    devices: Arc<Mutex<DeviceStore>>,
    connections: Arc<ConnectionManager>,
    relay_server_url: String,
    daemon_device_id: String,
    on_complete: OnPairingComplete,
    message_sink: MessageSink,
}

impl std::fmt::Debug for PairingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingCoordinator").finish_non_exhaustive()
    }
}

impl PairingCoordinator {
    pub fn new(
        devices: Arc<Mutex<DeviceStore>>,
        connections: Arc<ConnectionManager>,
        relay_server_url: String,
        daemon_device_id: String,
        on_complete: OnPairingComplete,
        message_sink: MessageSink,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            devices,
            connections,
            relay_server_url,
            daemon_device_id,
            on_complete,
            message_sink,
        }
    }

    /// Start a new pairing attempt: mint a master secret, derive keys and
    /// topic, create the session in `Pending`, and render the QR payload.
    /// The caller is responsible for subscribing the returned relay topic.
    pub async fn start_pairing(&self) -> anyhow::Result<(String, String)> {
        let master_secret = crypto::generate_master_secret();
        let session_id = crypto::derive_session_id(&master_secret);
        let auth_key = crypto::derive_key(&master_secret, "auth");
        let topic = crypto::derive_relay_topic(&master_secret);

        let session = PairingSession::new(session_id.clone(), master_secret, auth_key, topic.clone());
        self.sessions.lock().await.insert(session_id.clone(), session);

        let qr = qr::render_ascii_qr(&master_secret)?;
        log::info!("started pairing session {session_id} on relay topic {topic}");
        Ok((session_id, qr))
    }

    /// Subscribe to the relay topic for `session_id` and process inbound
    /// signaling envelopes until the session reaches a terminal state.
    pub async fn run_relay_loop(self: &Arc<Self>, session_id: &str) -> anyhow::Result<()> {
        let (signaling_key, topic) = {
            let sessions = self.sessions.lock().await;
            let session = sessions.get(session_id).ok_or_else(|| anyhow::anyhow!("unknown pairing session"))?;
            (crypto::derive_key(&session.master_secret, "signaling"), session.ntfy_topic.clone())
        };

        let relay = Arc::new(RelayClient::new(self.relay_server_url.clone(), topic));
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        relay.subscribe(tx).await;

        let handler = SignalingHandler::new(
            SignalingMode::Pairing { session_id: session_id.to_string(), signaling_key },
            CoordinatorCallbacks { coordinator: Arc::clone(self), session_id: session_id.to_string() },
        );

        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(session_id) {
                session.transition(PairingState::Signaling);
            }
        }

        while let Some(ciphertext) = rx.recv().await {
            if self.is_terminal(session_id).await {
                break;
            }
            if let Some(response) = handler.handle(&ciphertext).await {
                let _ = relay.publish(&response).await;
            }
        }

        relay.stop().await;
        Ok(())
    }

    async fn is_terminal(&self, session_id: &str) -> bool {
        self.sessions.lock().await.get(session_id).map(|s| s.state.is_terminal()).unwrap_or(true)
    }

    async fn accept_offer_for_session(&self, session_id: &str, offer_sdp: &str) -> anyhow::Result<(String, Arc<dyn Peer>)> {
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(session_id).ok_or_else(|| anyhow::anyhow!("unknown session"))?;
            session.transition(PairingState::Connecting);
        }

        let peer = Arc::new(WebRtcPeer::new(rustrtc::PeerConnectionConfig::default(), PeerOwner::SignalingHandler).await?);
        let answer_sdp = peer.accept_offer(offer_sdp, None).await?;
        Ok((answer_sdp, peer as Arc<dyn Peer>))
    }

    async fn on_peer_from_offer(&self, session_id: &str, device_id: &str, device_name: &str, peer: Arc<dyn Peer>) {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(session_id) {
                session.device_id = Some(device_id.to_string());
                session.device_name = Some(device_name.to_string());
                session.peer = Some(Arc::clone(&peer));
                session.transition(PairingState::Authenticating);
            }
        }

        let (auth_key, master_secret) = {
            let sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(session_id) else { return };
            (session.auth_key, session.master_secret)
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        peer.on_message(Box::new(move |bytes| {
            let _ = tx.try_send(bytes);
        }));

        if auth_handshake::run_server_handshake(&peer, &mut rx, &auth_key, &self.daemon_device_id).await.is_err() {
            self.fail_session(session_id).await;
            return;
        }

        let device_name = device_name.to_string();
        let device = crate::device::new_paired_device(device_id.to_string(), device_name.clone(), master_secret);
        if self.devices.lock().await.upsert(device).is_err() {
            self.fail_session(session_id).await;
            return;
        }

        peer.transfer_ownership(PeerOwner::ConnectionManager);
        let sink = Arc::clone(&self.message_sink);
        self.connections
            .add_connection(device_id.to_string(), Arc::clone(&peer), ConnectionCodec::Json, move |id, bytes| sink(id, bytes))
            .await;

        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(session_id) {
                session.finalize(device_id.to_string(), device_name.clone());
            }
        }

        (self.on_complete)(device_id.to_string(), device_name);
    }

    /// Complete a credential-only `PAIR_REQUEST`: verify the proof, persist
    /// the device, and finalize the session without ever touching a peer or
    /// the connection manager — there is no data channel in this flow.
    async fn accept_pair_request_for_session(&self, session_id: &str, request: &PairRequestPayload) -> Option<PairResponsePayload> {
        let (master_secret, auth_key) = {
            let sessions = self.sessions.lock().await;
            let session = sessions.get(session_id)?;
            (session.master_secret, session.auth_key)
        };

        let (device, response) = {
            let mut devices = self.devices.lock().await;
            pair_exchange::complete_pair_exchange(
                request,
                &master_secret,
                &auth_key,
                &self.daemon_device_id,
                &local_hostname(&self.daemon_device_id),
                &mut devices,
            )?
        };

        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(session_id) {
                session.finalize(device.device_id.clone(), device.display_name.clone());
            }
        }

        (self.on_complete)(device.device_id.clone(), device.display_name.clone());
        Some(response)
    }

    async fn fail_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            if session.should_close_peer() {
                if let Some(peer) = &session.peer {
                    peer.close_by_owner(PeerOwner::SignalingHandler);
                }
            }
            session.zeroize_secrets();
            session.transition(PairingState::Failed);
        }
    }

    pub async fn session_state(&self, session_id: &str) -> Option<PairingState> {
        self.sessions.lock().await.get(session_id).map(|s| s.state)
    }

    /// Sweep expired, non-terminal sessions. Called periodically by the
    /// orchestrator alongside the keep-alive loop.
    pub async fn sweep_expired(&self) {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            if session.is_expired() {
                session.zeroize_secrets();
                session.transition(PairingState::Expired);
            }
        }
    }
}

/// Adapts a [`PairingCoordinator`] to [`http_signal::HttpSignalBackend`] so a
/// device that skips the relay (same LAN, ntfy unreachable) can pair over a
/// direct HTTP POST instead of the QR/relay round trip.
pub struct HttpSignalAdapter {
    coordinator: Arc<PairingCoordinator>,
}

impl HttpSignalAdapter {
    pub fn new(coordinator: Arc<PairingCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait::async_trait]
impl http_signal::HttpSignalBackend for HttpSignalAdapter {
    async fn session_key(&self, session_id: &str) -> Option<[u8; 32]> {
        let sessions = self.coordinator.sessions.lock().await;
        let session = sessions.get(session_id)?;
        if session.state.is_terminal() {
            return None;
        }
        Some(crypto::derive_key(&session.master_secret, "signaling"))
    }

    async fn accept_offer(
        &self,
        session_id: &str,
        request: http_signal::SignalRequest,
    ) -> anyhow::Result<(String, Arc<dyn Peer>)> {
        let (answer_sdp, peer) = self.coordinator.accept_offer_for_session(session_id, &request.sdp_offer).await?;
        self.coordinator
            .on_peer_from_offer(session_id, &request.device_id, &request.device_name, Arc::clone(&peer))
            .await;
        Ok((answer_sdp, peer))
    }
}

struct CoordinatorCallbacks {
    coordinator: Arc<PairingCoordinator>,
    session_id: String,
}

#[async_trait::async_trait]
impl SignalingCallbacks for CoordinatorCallbacks {
    async fn accept_offer(&self, offer_sdp: &str) -> anyhow::Result<(String, Arc<dyn Peer>)> {
        self.coordinator.accept_offer_for_session(&self.session_id, offer_sdp).await
    }

    async fn on_peer_created(&self, device_id: &str, device_name: &str, peer: Arc<dyn Peer>) {
        self.coordinator.on_peer_from_offer(&self.session_id, device_id, device_name, peer).await;
    }

    async fn accept_pair_request(&self, request: &PairRequestPayload) -> Option<PairResponsePayload> {
        self.coordinator.accept_pair_request_for_session(&self.session_id, request).await
    }

    fn local_capabilities(&self) -> Vec<String> {
        vec!["terminal".into(), "clipboard".into(), "notifications".into()]
    }
}
