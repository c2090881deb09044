//! Relay-based WebRTC reconnection: one subscription per paired device on
//! that device's own derived topic, independent of the LAN-direct and
//! VPN-direct transports. This is how a device reconnects when it's on
//! neither the daemon's LAN nor its Tailscale tunnel.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection_manager::{ConnectionCodec, ConnectionManager};
use crate::crypto::{self, MasterSecret};
use crate::device::DeviceStore;
use crate::pairing::MessageSink;
use crate::peer::{Peer, PeerOwner, WebRtcPeer};
use crate::signaling::{Mode, RelayClient, SignalingCallbacks, SignalingHandler};

/// Subscribe to one already-paired device's relay topic and serve WebRTC
/// reconnection offers on it until the device is unpaired or the task is
/// aborted. The caller spawns one of these per paired device at startup and
/// again whenever a new device finishes pairing.
pub async fn serve_device(
    relay_server_url: String,
    device_id: String,
    master_secret: MasterSecret,
    devices: Arc<tokio::sync::Mutex<DeviceStore>>,
    connections: Arc<ConnectionManager>,
    message_sink: MessageSink,
) {
    let session_id = crypto::derive_session_id(&master_secret);
    let signaling_key = crypto::derive_key(&master_secret, "signaling");
    let topic = crypto::derive_relay_topic(&master_secret);

    let relay = Arc::new(RelayClient::new(relay_server_url, topic.clone()));
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    relay.subscribe(tx).await;

    let handler = SignalingHandler::new(
        Mode::Reconnection {
            session_id,
            device_id: device_id.clone(),
            signaling_key,
            devices: Arc::clone(&devices),
        },
        ReconnectCallbacks { connections, message_sink },
    );

    log::info!("listening for relay reconnection from device {device_id} on topic {topic}");

    while let Some(ciphertext) = rx.recv().await {
        if !devices.lock().await.contains(&device_id) {
            break;
        }
        if let Some(response) = handler.handle(&ciphertext).await {
            let _ = relay.publish(&response).await;
        }
    }

    relay.stop().await;
}

struct ReconnectCallbacks {
    connections: Arc<ConnectionManager>,
    message_sink: MessageSink,
}

#[async_trait]
impl SignalingCallbacks for ReconnectCallbacks {
    async fn accept_offer(&self, offer_sdp: &str) -> anyhow::Result<(String, Arc<dyn Peer>)> {
        let peer = Arc::new(WebRtcPeer::new(rustrtc::PeerConnectionConfig::default(), PeerOwner::SignalingHandler).await?);
        let answer_sdp = peer.accept_offer(offer_sdp, None).await?;
        Ok((answer_sdp, peer as Arc<dyn Peer>))
    }

    async fn on_peer_created(&self, device_id: &str, _device_name: &str, peer: Arc<dyn Peer>) {
        peer.transfer_ownership(PeerOwner::ConnectionManager);
        let sink = Arc::clone(&self.message_sink);
        self.connections
            .add_connection(device_id.to_string(), peer, ConnectionCodec::Json, move |id, bytes| sink(id, bytes))
            .await;
    }

    fn local_capabilities(&self) -> Vec<String> {
        vec!["terminal".into(), "clipboard".into(), "notifications".into()]
    }
}
