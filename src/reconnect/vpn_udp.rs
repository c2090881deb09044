//! VPN-direct framed UDP reconnection transport.
//!
//! A single UDP socket serves every remote. A handshake packet
//! (`magic(4) ∥ version(4)`, both big-endian) opens a logical connection per
//! `(remote_ip, remote_port)`; `on_connection` is always a spawned task,
//! never called inline, because it immediately calls `receive()` to consume
//! the auth packet that follows — calling it inline would deadlock the
//! listener's own receive loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::connection_manager::{ConnectionCodec, ConnectionManager};
use crate::constants::VPN_UDP_MAX_DEVICE_ID_LEN;
use crate::crypto;
use crate::device::DeviceStore;
use crate::pairing::MessageSink;
use crate::peer::{Peer, PeerOwner};

/// Magic bytes opening a new logical connection, matched exactly.
pub const HANDSHAKE_MAGIC: [u8; 4] = *b"RASU";
pub const PROTOCOL_VERSION: u32 = 1;

/// One logical connection multiplexed over the shared socket.
pub struct VpnUdpTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl VpnUdpTransport {
    /// Read the next length-prefixed payload from this logical connection.
    pub async fn receive(&self) -> Option<Vec<u8>> {
        self.inbound.lock().await.recv().await
    }

    /// Send a length-prefixed payload to this transport's remote address.
    pub async fn send(&self, payload: &[u8]) -> anyhow::Result<()> {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        self.socket.send_to(&framed, self.remote).await?;
        Ok(())
    }

    /// Closing a logical connection only marks it closed; the shared UDP
    /// socket stays open for every other remote.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct PendingConnection {
    inbound_tx: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// Listens on one UDP socket, demultiplexing packets by remote address into
/// per-remote logical connections. Cleans up lazily: a closed connection's
/// bookkeeping is dropped the next time a packet arrives for that remote
/// after `close()`.
pub struct VpnUdpListener {
    socket: Arc<UdpSocket>,
    devices: Arc<tokio::sync::Mutex<DeviceStore>>,
}

impl VpnUdpListener {
    pub async fn bind(addr: SocketAddr, devices: Arc<tokio::sync::Mutex<DeviceStore>>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket: Arc::new(socket), devices })
    }

    /// Run the demultiplexing loop. `on_connection` is invoked as a spawned
    /// task for every newly-opened logical connection; it must call
    /// `receive()` on the transport to read the auth packet that follows.
    pub async fn run<F>(&self, on_connection: F) -> anyhow::Result<()>
    where
        F: Fn(VpnUdpTransport) + Send + Sync + 'static,
    {
        let on_connection = Arc::new(on_connection);
        let mut connections: HashMap<SocketAddr, PendingConnection> = HashMap::new();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let (len, remote) = self.socket.recv_from(&mut buf).await?;
            let packet = &buf[..len];

            if let Some(pending) = connections.get(&remote) {
                if !pending.closed.load(Ordering::SeqCst) {
                    match decode_length_prefixed(packet) {
                        Some(payload) => {
                            if pending.inbound_tx.try_send(payload.to_vec()).is_err() {
                                log::warn!("dropping VPN UDP packet for {remote}: receiver backed up or gone");
                            }
                        }
                        None => log::warn!("dropping malformed length-prefixed VPN UDP packet from {remote}"),
                    }
                    continue;
                }
                connections.remove(&remote);
            }

            if packet.len() < 8 || packet[..4] != HANDSHAKE_MAGIC {
                log::debug!("dropping unrecognized UDP packet from unknown remote {remote}");
                continue;
            }
            let version = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
            if version != PROTOCOL_VERSION {
                log::warn!("rejecting VPN UDP handshake from {remote}: unsupported version {version}");
                continue;
            }

            let (tx, rx) = mpsc::channel(64);
            let closed = Arc::new(AtomicBool::new(false));
            connections.insert(remote, PendingConnection { inbound_tx: tx, closed: Arc::clone(&closed) });

            let transport = VpnUdpTransport { socket: Arc::clone(&self.socket), remote, inbound: Mutex::new(rx), closed };
            let callback = Arc::clone(&on_connection);
            tokio::spawn(async move { callback(transport) });
        }
    }

    /// Validate an auth payload against the device store: `len:uint32 ∥
    /// device_id(UTF-8) ∥ auth_key(32)`.
    pub async fn authenticate(&self, payload: &[u8]) -> Option<String> {
        if payload.len() < 4 {
            return None;
        }
        let id_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        if id_len == 0 || id_len > VPN_UDP_MAX_DEVICE_ID_LEN {
            return None;
        }
        let rest = &payload[4..];
        if rest.len() != id_len + 32 {
            return None;
        }
        let device_id = std::str::from_utf8(&rest[..id_len]).ok()?.to_string();
        let supplied_key = &rest[id_len..];

        let devices = self.devices.lock().await;
        let device = devices.get(&device_id)?;
        let expected_key = crypto::derive_key(&device.master_secret, "auth");
        if constant_time_eq(&expected_key, supplied_key) {
            Some(device_id)
        } else {
            None
        }
    }
}

/// Strip and validate a `len:uint32(BE) ∥ payload` frame, returning the
/// payload slice.
fn decode_length_prefixed(packet: &[u8]) -> Option<&[u8]> {
    if packet.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
    let payload = &packet[4..];
    if payload.len() != len {
        return None;
    }
    Some(payload)
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

type CloseCallback = Arc<StdMutex<Option<Box<dyn Fn() + Send + Sync>>>>;

/// Adapts a [`VpnUdpTransport`] (already past its auth handshake) to the
/// [`Peer`] trait so it can sit in the connection manager alongside the
/// WebRTC and LAN-WS peers.
struct VpnUdpPeer {
    transport: Arc<VpnUdpTransport>,
    on_close: CloseCallback,
}

impl VpnUdpPeer {
    fn new(transport: VpnUdpTransport) -> Self {
        Self { transport: Arc::new(transport), on_close: Arc::new(StdMutex::new(None)) }
    }
}

#[async_trait]
impl Peer for VpnUdpPeer {
    async fn send(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.transport.send(bytes).await
    }

    fn close_by_owner(&self, _caller: PeerOwner) {
        self.transport.close();
    }

    fn transfer_ownership(&self, _new_owner: PeerOwner) {}

    fn on_message(&self, cb: Box<dyn Fn(Vec<u8>) + Send + Sync>) {
        let transport = Arc::clone(&self.transport);
        let on_close = Arc::clone(&self.on_close);
        tokio::spawn(async move {
            while !transport.is_closed() {
                match transport.receive().await {
                    Some(bytes) => cb(bytes),
                    None => break,
                }
            }
            if let Some(cb) = on_close.lock().expect("vpn udp close callback mutex poisoned").as_ref() {
                cb();
            }
        });
    }

    fn on_close(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.on_close.lock().expect("vpn udp close callback mutex poisoned") = Some(cb);
    }
}

/// Run the listener's demultiplexing loop, authenticating the first packet
/// on every newly-opened logical connection and handing authenticated
/// transports to the connection manager. Never returns under normal
/// operation; intended to be spawned as its own task by the orchestrator.
pub async fn serve(
    listener: Arc<VpnUdpListener>,
    connections: Arc<ConnectionManager>,
    message_sink: MessageSink,
) -> anyhow::Result<()> {
    let listener_for_run = Arc::clone(&listener);
    listener_for_run
        .run(move |transport| {
            let listener = Arc::clone(&listener);
            let connections = Arc::clone(&connections);
            let message_sink = Arc::clone(&message_sink);
            tokio::spawn(async move {
                let Some(auth_payload) = transport.receive().await else { return };
                let Some(device_id) = listener.authenticate(&auth_payload).await else {
                    log::warn!("dropping VPN UDP connection from {}: authentication failed", transport.remote);
                    transport.close();
                    return;
                };

                let peer: Arc<dyn Peer> = Arc::new(VpnUdpPeer::new(transport));
                let sink = Arc::clone(&message_sink);
                connections
                    .add_connection(device_id, peer, ConnectionCodec::Json, move |id, bytes| sink(id, bytes))
                    .await;
            });
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::new_paired_device;
    use std::path::PathBuf;

    fn temp_devices() -> Arc<tokio::sync::Mutex<DeviceStore>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::mem::forget(dir);
        Arc::new(tokio::sync::Mutex::new(DeviceStore::load(PathBuf::from(path)).unwrap()))
    }

    #[tokio::test]
    async fn authenticate_accepts_matching_key_and_rejects_wrong_one() {
        let devices = temp_devices();
        let master_secret = [3u8; 32];
        devices.lock().await.upsert(new_paired_device("dev-1".into(), "Phone".into(), master_secret)).unwrap();

        let listener = VpnUdpListener::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&devices)).await.unwrap();

        let auth_key = crypto::derive_key(&master_secret, "auth");
        let mut payload = Vec::new();
        payload.extend_from_slice(&(b"dev-1".len() as u32).to_be_bytes());
        payload.extend_from_slice(b"dev-1");
        payload.extend_from_slice(&auth_key);
        assert_eq!(listener.authenticate(&payload).await, Some("dev-1".to_string()));

        let mut wrong = payload.clone();
        let last = wrong.len() - 1;
        wrong[last] ^= 0xFF;
        assert_eq!(listener.authenticate(&wrong).await, None);
    }

    #[tokio::test]
    async fn authenticate_rejects_oversized_device_id_length() {
        let devices = temp_devices();
        let listener = VpnUdpListener::bind("127.0.0.1:0".parse().unwrap(), devices).await.unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&((VPN_UDP_MAX_DEVICE_ID_LEN + 1) as u32).to_be_bytes());
        assert_eq!(listener.authenticate(&payload).await, None);
    }

    #[test]
    fn length_prefixed_decode_rejects_length_mismatch() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&5u32.to_be_bytes());
        packet.extend_from_slice(b"abc");
        assert!(decode_length_prefixed(&packet).is_none());
    }

    #[test]
    fn length_prefixed_decode_round_trips() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&3u32.to_be_bytes());
        packet.extend_from_slice(b"abc");
        assert_eq!(decode_length_prefixed(&packet), Some(&b"abc"[..]));
    }

    #[tokio::test]
    async fn authenticate_rejects_truncated_payload() {
        let devices = temp_devices();
        let listener = VpnUdpListener::bind("127.0.0.1:0".parse().unwrap(), devices).await.unwrap();
        assert_eq!(listener.authenticate(&[0, 0, 0, 5]).await, None);
    }
}
