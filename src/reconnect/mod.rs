//! Reconnection transports: LAN-direct WebSocket, VPN-direct framed UDP, and
//! relay-based WebRTC.
//!
//! The first two authenticate with `HMAC(auth_key, device_id ∥
//! be64(timestamp) ∥ body)` (LAN WS) or a one-shot device-id/key payload (VPN
//! UDP). The relay transport instead re-derives each paired device's own
//! signaling key and subscribes to its topic, the same way the pairing flow
//! authenticates an `OFFER` over the relay.

pub mod lan_ws;
pub mod relay;
pub mod vpn_udp;

pub use vpn_udp::{VpnUdpListener, VpnUdpTransport};
