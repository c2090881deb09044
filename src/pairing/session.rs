//! The pairing session state machine.
//!
//! `peer_transferred` is a hard invariant: it must be set to `true` strictly
//! before the state becomes `Completed`, so any observer (CLI poller,
//! cleanup path) that sees `Completed` also sees a nulled peer reference.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use zeroize::Zeroize;

use crate::constants::{PAIRING_AUTH_TIMEOUT, PAIRING_CONNECTING_TIMEOUT, PAIRING_QR_TIMEOUT, PAIRING_SIGNALING_TIMEOUT};
use crate::crypto::MasterSecret;
use crate::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Pending,
    Signaling,
    Connecting,
    Authenticating,
    Authenticated,
    Completed,
    Failed,
    Expired,
}

impl PairingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// A single in-flight pairing attempt.
pub struct PairingSession {
    pub session_id: String,
    pub master_secret: MasterSecret,
    pub auth_key: [u8; 32],
    pub ntfy_topic: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub state: PairingState,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub peer: Option<Arc<dyn Peer>>,
    pub peer_transferred: bool,
}

impl std::fmt::Debug for PairingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingSession")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("peer_transferred", &self.peer_transferred)
            .finish_non_exhaustive()
    }
}

impl PairingSession {
    pub fn new(session_id: String, master_secret: MasterSecret, auth_key: [u8; 32], ntfy_topic: String) -> Self {
        let now = now_unix();
        Self {
            session_id,
            master_secret,
            auth_key,
            ntfy_topic,
            created_at: now,
            expires_at: now + PAIRING_QR_TIMEOUT.as_secs(),
            state: PairingState::Pending,
            device_id: None,
            device_name: None,
            peer: None,
            peer_transferred: false,
        }
    }

    /// Advance to a new state, extending `expires_at` by that state's
    /// allotment. Terminal states don't extend the deadline.
    pub fn transition(&mut self, new_state: PairingState) {
        let now = now_unix();
        self.expires_at = match new_state {
            PairingState::Signaling => now + PAIRING_SIGNALING_TIMEOUT.as_secs(),
            PairingState::Connecting => now + PAIRING_CONNECTING_TIMEOUT.as_secs(),
            PairingState::Authenticating => now + PAIRING_AUTH_TIMEOUT.as_secs(),
            _ => self.expires_at,
        };
        log::info!("pairing session {} transitioning {:?} -> {:?}", self.session_id, self.state, new_state);
        self.state = new_state;
    }

    pub fn is_expired(&self) -> bool {
        !self.state.is_terminal() && now_unix() > self.expires_at
    }

    /// Strict ordering: `peer_transferred` is set, then the state becomes
    /// `Completed`. Never reorder these two writes.
    pub fn finalize(&mut self, device_id: String, device_name: String) {
        self.device_id = Some(device_id);
        self.device_name = Some(device_name);
        self.peer = None;
        self.peer_transferred = true;
        self.transition(PairingState::Completed);
    }

    /// Zero the master secret and auth key on failure or cleanup.
    pub fn zeroize_secrets(&mut self) {
        self.master_secret.zeroize();
        self.auth_key.zeroize();
    }

    /// Safe to close: only when ownership has *not* already moved on.
    pub fn should_close_peer(&self) -> bool {
        !self.peer_transferred && self.peer.is_some()
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_sets_transferred_before_completed() {
        let mut session = PairingSession::new("s1".into(), [0u8; 32], [1u8; 32], "ras-abc".into());
        session.finalize("dev-1".into(), "Phone".into());
        assert!(session.peer_transferred);
        assert_eq!(session.state, PairingState::Completed);
        assert!(session.peer.is_none());
    }

    #[test]
    fn should_close_peer_respects_transfer_flag() {
        let mut session = PairingSession::new("s1".into(), [0u8; 32], [1u8; 32], "ras-abc".into());
        assert!(!session.should_close_peer());
        session.peer_transferred = true;
        assert!(!session.should_close_peer());
    }

    #[test]
    fn expiry_chain_extends_deadline_per_state() {
        let mut session = PairingSession::new("s1".into(), [0u8; 32], [1u8; 32], "ras-abc".into());
        let pending_deadline = session.expires_at;
        session.transition(PairingState::Signaling);
        assert!(session.expires_at <= pending_deadline || session.expires_at >= now_unix());
    }
}
