//! Connection manager: the authenticated-device registry.
//!
//! A `device_id → Connection` map. Each connection owns the peer and a
//! decoder callback installed at registration time. A background keep-alive
//! sweep closes anything that's gone quiet past the idle timeout; `close_all`
//! closes everything in parallel at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::constants::{CONNECTION_IDLE_TIMEOUT, KEEP_ALIVE_INTERVAL};
use crate::peer::{Peer, PeerOwner};

/// Wire encoding used for command/event envelopes on a connection's control
/// channel. Every transport in this daemon speaks JSON today; the field
/// stays on the tuple because the spec's `Connection` is transport-agnostic
/// and a future transport (e.g. a binary-framed one) would vary it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCodec {
    Json,
}

/// A single authenticated, reachable device.
pub struct Connection {
    pub device_id: String,
    pub peer: Arc<dyn Peer>,
    pub codec: ConnectionCodec,
    last_activity: AtomicU64,
}

impl Connection {
    fn touch(&self) {
        self.last_activity.store(now_unix(), Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::SeqCst);
        Duration::from_secs(now_unix().saturating_sub(last))
    }
}

/// Registry of authenticated peers, keyed by device id.
pub struct ConnectionManager {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        let manager = Arc::new(Self { connections: Mutex::new(HashMap::new()), sweep: Mutex::new(None) });
        manager
    }

    /// Register a connection, install the on-message/on-close callbacks, and
    /// record its first activity timestamp. Replaces (and orphans) any
    /// previous connection for the same `device_id` without closing it —
    /// callers are expected to have already transferred ownership.
    pub async fn add_connection(
        self: &Arc<Self>,
        device_id: String,
        peer: Arc<dyn Peer>,
        codec: ConnectionCodec,
        on_message: impl Fn(String, Vec<u8>) + Send + Sync + 'static,
    ) {
        let connection = Arc::new(Connection {
            device_id: device_id.clone(),
            peer: Arc::clone(&peer),
            codec,
            last_activity: AtomicU64::new(now_unix()),
        });

        let manager = Arc::clone(self);
        let touch_id = device_id.clone();
        peer.on_message(Box::new(move |bytes| {
            if let Some(conn) = manager.blocking_get(&touch_id) {
                conn.touch();
            }
            on_message(touch_id.clone(), bytes);
        }));

        let manager = Arc::clone(self);
        let close_id = device_id.clone();
        peer.on_close(Box::new(move || {
            let manager = Arc::clone(&manager);
            let close_id = close_id.clone();
            tokio::spawn(async move {
                manager.remove(&close_id).await;
            });
        }));

        self.connections.lock().await.insert(device_id, connection);
    }

    /// Best-effort synchronous peek used only from inside the native peer
    /// callback, which must not await. Falls back to `None` under contention
    /// rather than blocking the callback thread.
    fn blocking_get(&self, device_id: &str) -> Option<Arc<Connection>> {
        self.connections.try_lock().ok()?.get(device_id).cloned()
    }

    pub async fn send(&self, device_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let connection = {
            let connections = self.connections.lock().await;
            connections.get(device_id).cloned()
        };
        match connection {
            Some(connection) => {
                connection.touch();
                connection.peer.send(bytes).await
            }
            None => anyhow::bail!("no connection for device {device_id}"),
        }
    }

    pub async fn broadcast(&self, bytes: &[u8]) {
        let connections: Vec<Arc<Connection>> = self.connections.lock().await.values().cloned().collect();
        for connection in connections {
            if let Err(e) = connection.peer.send(bytes).await {
                log::warn!("broadcast to {} failed: {e:#}", connection.device_id);
            }
        }
    }

    pub async fn remove(&self, device_id: &str) -> Option<Arc<Connection>> {
        let connection = self.connections.lock().await.remove(device_id);
        if let Some(connection) = &connection {
            connection.peer.close_by_owner(PeerOwner::ConnectionManager);
        }
        connection
    }

    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.connections.lock().await.contains_key(device_id)
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.connections.lock().await.keys().cloned().collect()
    }

    /// Start the background keep-alive sweep. Idempotent: a second call
    /// replaces the previous task.
    pub async fn start_keep_alive(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEP_ALIVE_INTERVAL);
            loop {
                interval.tick().await;
                manager.sweep_idle().await;
            }
        });
        *self.sweep.lock().await = Some(handle);
    }

    async fn sweep_idle(&self) {
        let stale: Vec<String> = {
            let connections = self.connections.lock().await;
            connections
                .values()
                .filter(|c| c.idle_for() > CONNECTION_IDLE_TIMEOUT)
                .map(|c| c.device_id.clone())
                .collect()
        };
        for device_id in stale {
            log::info!("closing idle connection for device {device_id}");
            self.remove(&device_id).await;
        }
    }

    /// Close every connection in parallel. Called at shutdown.
    pub async fn close_all(&self) {
        if let Some(handle) = self.sweep.lock().await.take() {
            handle.abort();
        }
        let mut connections = self.connections.lock().await;
        for (_, connection) in connections.drain() {
            connection.peer.close_by_owner(PeerOwner::ConnectionManager);
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FakePeer {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Peer for FakePeer {
        async fn send(&self, _bytes: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        fn close_by_owner(&self, _caller: PeerOwner) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn transfer_ownership(&self, _new_owner: PeerOwner) {}
        fn on_message(&self, _cb: Box<dyn Fn(Vec<u8>) + Send + Sync>) {}
        fn on_close(&self, _cb: Box<dyn Fn() + Send + Sync>) {}
    }

    #[tokio::test]
    async fn add_then_send_routes_to_the_right_peer() {
        let manager = ConnectionManager::new();
        let peer: Arc<dyn Peer> = Arc::new(FakePeer { closed: AtomicBool::new(false) });
        manager.add_connection("dev-1".to_string(), peer, ConnectionCodec::Json, |_, _| {}).await;

        assert!(manager.is_connected("dev-1").await);
        assert!(manager.send("dev-1", b"hello").await.is_ok());
        assert!(manager.send("dev-2", b"hello").await.is_err());
    }

    #[tokio::test]
    async fn remove_closes_the_peer_and_drops_it_from_the_map() {
        let manager = ConnectionManager::new();
        let peer = Arc::new(FakePeer { closed: AtomicBool::new(false) });
        manager.add_connection("dev-1".to_string(), Arc::clone(&peer) as Arc<dyn Peer>, ConnectionCodec::Json, |_, _| {}).await;

        manager.remove("dev-1").await;
        assert!(!manager.is_connected("dev-1").await);
        assert!(peer.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_all_empties_the_map() {
        let manager = ConnectionManager::new();
        for i in 0..3 {
            let peer: Arc<dyn Peer> = Arc::new(FakePeer { closed: AtomicBool::new(false) });
            manager.add_connection(format!("dev-{i}"), peer, ConnectionCodec::Json, |_, _| {}).await;
        }
        manager.close_all().await;
        assert!(manager.device_ids().await.is_empty());
    }
}
