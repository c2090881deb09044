//! Peer abstraction: wraps the ICE/DTLS peer connection and the ownership
//! discipline that prevents a double-close race during handoff.
//!
//! Every long-lived peer carries an `owner` tag. `close_by_owner(caller)`
//! only closes if `owner == caller`; otherwise it's a no-op with a warning.
//! This is what lets the pairing coordinator finalize, transfer ownership to
//! the connection manager, and drop its own scoped guard without racing the
//! connection manager's first send.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rustrtc::{
    PeerConnection, PeerConnectionConfig, PeerConnectionState, SdpType, SessionDescription,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

use crate::tailscale::{inject_vpn_candidate, TailscaleClient};

/// Label of the single negotiated data channel both sides must configure
/// identically. This is a wire contract, not a convention.
pub const CONTROL_CHANNEL_LABEL: &str = "ras-control";
/// Channel id for the negotiated control channel.
pub const CONTROL_CHANNEL_ID: u16 = 0;

/// Who currently owns a peer and may close it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOwner {
    SignalingHandler,
    PairingSession,
    ConnectionManager,
    Disposed,
}

impl PeerOwner {
    fn to_tag(self) -> u8 {
        match self {
            Self::SignalingHandler => 0,
            Self::PairingSession => 1,
            Self::ConnectionManager => 2,
            Self::Disposed => 3,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::SignalingHandler,
            1 => Self::PairingSession,
            2 => Self::ConnectionManager,
            _ => Self::Disposed,
        }
    }
}

/// Capability set exposed by any peer transport, whether it's the relayed
/// WebRTC path or a future transport added behind this trait.
#[async_trait]
pub trait Peer: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> Result<()>;
    fn close_by_owner(&self, caller: PeerOwner);
    fn transfer_ownership(&self, new_owner: PeerOwner);
    fn on_message(&self, cb: Box<dyn Fn(Vec<u8>) + Send + Sync>);
    fn on_close(&self, cb: Box<dyn Fn() + Send + Sync>);
}

type MessageCallback = Arc<StdMutex<Option<Box<dyn Fn(Vec<u8>) + Send + Sync>>>>;
type CloseCallback = Arc<StdMutex<Option<Box<dyn Fn() + Send + Sync>>>>;

/// WebRTC peer wrapping `rustrtc::PeerConnection`.
pub struct WebRtcPeer {
    connection: Arc<PeerConnection>,
    owner: AtomicU8,
    on_message: MessageCallback,
    on_close: CloseCallback,
}

impl std::fmt::Debug for WebRtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeer")
            .field("owner", &PeerOwner::from_tag(self.owner.load(Ordering::SeqCst)))
            .finish_non_exhaustive()
    }
}

impl WebRtcPeer {
    /// Create a new peer connection with no remote description yet.
    pub async fn new(config: PeerConnectionConfig, initial_owner: PeerOwner) -> Result<Self> {
        let connection = PeerConnection::new(config).context("failed to create peer connection")?;
        Ok(Self {
            connection: Arc::new(connection),
            owner: AtomicU8::new(initial_owner.to_tag()),
            on_message: Arc::new(StdMutex::new(None)),
            on_close: Arc::new(StdMutex::new(None)),
        })
    }

    /// Apply a remote SDP offer and generate a local answer.
    ///
    /// Drives ICE gathering to completion, best-effort, before returning —
    /// so the returned SDP carries a reasonably complete candidate set.
    pub async fn accept_offer(&self, offer_sdp: &str, vpn: Option<&TailscaleClient>) -> Result<String> {
        let offer = SessionDescription::parse(SdpType::Offer, offer_sdp).context("invalid offer SDP")?;
        self.connection
            .set_remote_description(offer)
            .await
            .context("failed to set remote description")?;

        let answer = self.connection.create_answer().await.context("failed to create answer")?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .context("failed to set local description")?;

        self.wait_ice_gathering_complete().await;

        let mut answer_sdp = self.connection.local_description().map(|d| d.sdp).unwrap_or(answer.sdp);
        if let Some(client) = vpn {
            answer_sdp = inject_vpn_candidate(&answer_sdp, client);
        }
        Ok(answer_sdp)
    }

    /// Best-effort wait for ICE gathering to finish within the configured bound.
    async fn wait_ice_gathering_complete(&self) {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.connection.on_ice_gathering_state_change(move |state| {
            if state.is_complete() {
                if let Some(tx) = tx.try_lock().ok().and_then(|mut g| g.take()) {
                    let _ = tx.send(());
                }
            }
        });

        if timeout(crate::constants::ICE_GATHER_TIMEOUT, rx).await.is_err() {
            log::warn!("ICE gathering did not complete within the bound; proceeding with partial candidates");
        }
    }

    /// Block until the peer connection is `Connected` and the control data
    /// channel is open, or fail with a timeout.
    pub async fn wait_connected(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let connection = Arc::clone(&self.connection);
        self.connection.on_connection_state_change(move |state| {
            if state == PeerConnectionState::Connected && connection.data_channel_is_open(CONTROL_CHANNEL_ID) {
                if let Some(tx) = tx.try_lock().ok().and_then(|mut g| g.take()) {
                    let _ = tx.send(());
                }
            }
        });

        match timeout(crate::constants::PEER_CONNECTED_TIMEOUT, rx).await {
            Ok(_) => Ok(()),
            Err(_) => bail!("timed out waiting for peer connection"),
        }
    }

    fn owner(&self) -> PeerOwner {
        PeerOwner::from_tag(self.owner.load(Ordering::SeqCst))
    }

    /// Forces the transition regardless of owner. Reserved for shutdown paths
    /// that must guarantee every peer closes; prefer `close_by_owner`.
    pub fn close(&self) {
        self.owner.store(PeerOwner::Disposed.to_tag(), Ordering::SeqCst);
        self.connection.close();
    }
}

#[async_trait]
impl Peer for WebRtcPeer {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.connection
            .send_data_channel_message(CONTROL_CHANNEL_ID, bytes)
            .await
            .context("failed to send on control channel")
    }

    fn close_by_owner(&self, caller: PeerOwner) {
        let current = self.owner();
        if current != caller {
            log::warn!("close_by_owner({caller:?}) ignored: current owner is {current:?}");
            return;
        }
        self.owner.store(PeerOwner::Disposed.to_tag(), Ordering::SeqCst);
        self.connection.close();
    }

    fn transfer_ownership(&self, new_owner: PeerOwner) {
        if self.owner() == PeerOwner::Disposed {
            log::warn!("transfer_ownership({new_owner:?}) ignored: peer already disposed");
            return;
        }
        self.owner.store(new_owner.to_tag(), Ordering::SeqCst);
    }

    fn on_message(&self, cb: Box<dyn Fn(Vec<u8>) + Send + Sync>) {
        *self.on_message.lock().expect("peer message callback mutex poisoned") = Some(cb);
        let slot = Arc::clone(&self.on_message);
        self.connection.on_data_channel_message(CONTROL_CHANNEL_ID, move |bytes| {
            if let Some(cb) = slot.lock().expect("peer message callback mutex poisoned").as_ref() {
                cb(bytes);
            }
        });
    }

    fn on_close(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.on_close.lock().expect("peer close callback mutex poisoned") = Some(cb);
        let slot = Arc::clone(&self.on_close);
        self.connection.on_connection_state_change(move |state| {
            if matches!(
                state,
                PeerConnectionState::Disconnected | PeerConnectionState::Failed | PeerConnectionState::Closed
            ) {
                if let Some(cb) = slot.lock().expect("peer close callback mutex poisoned").as_ref() {
                    cb();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_tag_round_trips() {
        for owner in [
            PeerOwner::SignalingHandler,
            PeerOwner::PairingSession,
            PeerOwner::ConnectionManager,
            PeerOwner::Disposed,
        ] {
            assert_eq!(PeerOwner::from_tag(owner.to_tag()), owner);
        }
    }
}
