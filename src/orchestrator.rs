//! Startup validation, component wiring, and graceful shutdown.
//!
//! Mirrors the teacher's `Hub` in spirit (one struct owning every
//! collaborator, a `setup`/`shutdown` pair) but built for an async,
//! signal-driven daemon rather than a polled TUI event loop.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex as TokioMutex;

use crate::clipboard::{ClipboardEvent, ClipboardEventEmitter, ClipboardManager};
use crate::config::Config;
use crate::connection_manager::ConnectionManager;
use crate::device::DeviceStore;
use crate::dispatcher::Dispatcher;
use crate::notifications::{self, NotificationDispatcher};
use crate::pairing::{HttpSignalAdapter, PairingCoordinator};
use crate::reconnect::{lan_ws, relay, vpn_udp, VpnUdpListener};
use crate::sessions::{SessionEvent, SessionEventEmitter, SessionManager};
use crate::terminal::{MatcherFeed, TerminalEvent, TerminalEventEmitter, TerminalManager};
use crate::tmux::Tmux;
use crate::{pairing, wire};

/// The running daemon: every long-lived collaborator plus the background
/// tasks spawned for it, kept around so `shutdown` can tear them down.
pub struct Orchestrator {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub devices: Arc<TokioMutex<DeviceStore>>,
    pub pairing: Arc<PairingCoordinator>,
    pub sessions: Arc<SessionManager>,
    pub terminal: Arc<TerminalManager>,
    pub notifications: Arc<NotificationDispatcher>,
    pub clipboard: Arc<ClipboardManager>,
    tasks: TokioMutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Relay-reconnection listeners, one per paired device. Grows over the
    /// daemon's lifetime as new devices pair; kept separate from `tasks`
    /// since it's mutated after startup, not just drained at shutdown.
    relay_tasks: Arc<TokioMutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

/// Envelope wrapper used to fan session/terminal/clipboard events out to
/// connected devices as `{ "type": ..., ...fields }` JSON, the same shape
/// `wire::register_all`'s handlers reply with.
#[derive(Serialize)]
struct Envelope<T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    body: T,
}

async fn broadcast_json(connections: &ConnectionManager, kind: &'static str, body: impl Serialize) {
    match serde_json::to_vec(&Envelope { kind, body }) {
        Ok(bytes) => connections.broadcast(&bytes).await,
        Err(e) => log::error!("failed to serialize {kind} event: {e:#}"),
    }
}

async fn send_json(connections: &ConnectionManager, device_id: &str, kind: &'static str, body: impl Serialize) {
    match serde_json::to_vec(&Envelope { kind, body }) {
        Ok(bytes) => {
            if let Err(e) = connections.send(device_id, &bytes).await {
                log::debug!("failed to deliver {kind} to {device_id}: {e:#}");
            }
        }
        Err(e) => log::error!("failed to serialize {kind} event: {e:#}"),
    }
}

struct DaemonSessionEmitter {
    connections: Arc<ConnectionManager>,
}

#[async_trait]
impl SessionEventEmitter for DaemonSessionEmitter {
    async fn emit(&self, event: SessionEvent) {
        match event {
            SessionEvent::Created(record) => broadcast_json(&self.connections, "session_created", record).await,
            SessionEvent::Killed { id } => broadcast_json(&self.connections, "session_killed", serde_json::json!({ "id": id })).await,
            SessionEvent::Renamed { id, display_name } => {
                broadcast_json(&self.connections, "session_renamed", serde_json::json!({ "id": id, "display_name": display_name })).await
            }
            SessionEvent::Error { code, message } => {
                broadcast_json(&self.connections, "session_error", serde_json::json!({ "code": code, "message": message })).await
            }
        }
    }
}

struct DaemonTerminalEmitter {
    connections: Arc<ConnectionManager>,
}

#[async_trait]
impl TerminalEventEmitter for DaemonTerminalEmitter {
    async fn emit(&self, device_id: &str, event: TerminalEvent) {
        match event {
            TerminalEvent::Attached { session_id, buffer_start_sequence, current_sequence } => {
                send_json(
                    &self.connections,
                    device_id,
                    "terminal_attached",
                    serde_json::json!({ "session_id": session_id, "buffer_start_sequence": buffer_start_sequence, "current_sequence": current_sequence }),
                )
                .await;
            }
            TerminalEvent::OutputSkipped { session_id, requested_sequence, resumed_at_sequence } => {
                send_json(
                    &self.connections,
                    device_id,
                    "terminal_output_skipped",
                    serde_json::json!({ "session_id": session_id, "requested_sequence": requested_sequence, "resumed_at_sequence": resumed_at_sequence }),
                )
                .await;
            }
            TerminalEvent::Output { session_id, data, sequence } => {
                send_json(
                    &self.connections,
                    device_id,
                    "terminal_output",
                    serde_json::json!({ "session_id": session_id, "data": BASE64.encode(data), "sequence": sequence }),
                )
                .await;
            }
            TerminalEvent::Detached { session_id, reason } => {
                send_json(&self.connections, device_id, "terminal_detached", serde_json::json!({ "session_id": session_id, "reason": format!("{reason:?}") })).await;
            }
            TerminalEvent::Notification { session_id, kind, title, body, snippet, timestamp_ms } => {
                send_json(
                    &self.connections,
                    device_id,
                    "notification",
                    serde_json::json!({ "session_id": session_id, "kind": kind, "title": title, "body": body, "snippet": snippet, "timestamp_ms": timestamp_ms }),
                )
                .await;
            }
        }
    }
}

struct DaemonClipboardEmitter {
    connections: Arc<ConnectionManager>,
}

#[async_trait]
impl ClipboardEventEmitter for DaemonClipboardEmitter {
    async fn emit(&self, device_id: &str, event: ClipboardEvent) {
        match event {
            ClipboardEvent::Progress { transfer_id, received_chunks, total_chunks } => {
                send_json(
                    &self.connections,
                    device_id,
                    "clipboard_progress",
                    serde_json::json!({ "transfer_id": transfer_id, "received_chunks": received_chunks, "total_chunks": total_chunks }),
                )
                .await;
            }
            ClipboardEvent::Complete { transfer_id, content_type } => {
                send_json(&self.connections, device_id, "clipboard_complete", serde_json::json!({ "transfer_id": transfer_id, "content_type": format!("{content_type:?}") })).await;
            }
            ClipboardEvent::Error { transfer_id, code, message } => {
                send_json(&self.connections, device_id, "clipboard_error", serde_json::json!({ "transfer_id": transfer_id, "code": code, "message": message })).await;
            }
            ClipboardEvent::Cancelled { transfer_id } => {
                send_json(&self.connections, device_id, "clipboard_cancelled", serde_json::json!({ "transfer_id": transfer_id })).await;
            }
            ClipboardEvent::ApprovalRequired { size, preview } => {
                send_json(&self.connections, device_id, "clipboard_approval_required", serde_json::json!({ "size": size, "preview": preview })).await;
            }
        }
    }
}

impl Orchestrator {
    /// Validate the environment, wire every collaborator, and bind the three
    /// inbound transports. Does not block; callers should subsequently keep
    /// the process alive (e.g. by awaiting a shutdown signal) and then call
    /// [`Orchestrator::shutdown`].
    pub async fn start(config: Config) -> anyhow::Result<Arc<Self>> {
        let tmux = Tmux::new(config.multiplexer_binary.clone());
        tmux.verify_version()?;

        let devices = Arc::new(TokioMutex::new(DeviceStore::load(DeviceStore::default_path()?)?));

        let connections = ConnectionManager::new();
        let dispatcher = Arc::new(Dispatcher::default());

        let message_sink: pairing::MessageSink = {
            let dispatcher = Arc::clone(&dispatcher);
            Arc::new(move |device_id, bytes| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher.dispatch_raw(&device_id, &bytes).await;
                });
            })
        };

        let daemon_device_id = load_or_create_daemon_id()?;

        let relay_tasks: Arc<TokioMutex<Vec<tokio::task::JoinHandle<()>>>> = Arc::new(TokioMutex::new(Vec::new()));
        let on_complete: pairing::OnPairingComplete = {
            let relay_server_url = config.relay_server_url.clone();
            let devices = Arc::clone(&devices);
            let connections = Arc::clone(&connections);
            let message_sink = Arc::clone(&message_sink);
            let relay_tasks = Arc::clone(&relay_tasks);
            Arc::new(move |device_id, device_name| {
                log::info!("pairing complete: device {device_id} ({device_name})");
                let relay_server_url = relay_server_url.clone();
                let devices = Arc::clone(&devices);
                let connections = Arc::clone(&connections);
                let message_sink = Arc::clone(&message_sink);
                let relay_tasks = Arc::clone(&relay_tasks);
                tokio::spawn(async move {
                    let master_secret = devices.lock().await.get(&device_id).map(|d| d.master_secret);
                    let Some(master_secret) = master_secret else { return };
                    let handle = tokio::spawn(relay::serve_device(relay_server_url, device_id, master_secret, devices, connections, message_sink));
                    relay_tasks.lock().await.push(handle);
                });
            })
        };

        let pairing_coordinator = Arc::new(PairingCoordinator::new(
            Arc::clone(&devices),
            Arc::clone(&connections),
            config.relay_server_url.clone(),
            daemon_device_id,
            on_complete,
            Arc::clone(&message_sink),
        ));

        let session_store_path = Config::config_dir()?.join("sessions.json");
        let session_emitter: Arc<dyn SessionEventEmitter> = Arc::new(DaemonSessionEmitter { connections: Arc::clone(&connections) });
        let sessions = Arc::new(SessionManager::new(session_store_path, config.clone(), session_emitter)?);
        sessions.initialize().await?;

        let fifo_dir = Config::config_dir()?.join("fifos");
        std::fs::create_dir_all(&fifo_dir)?;
        let terminal_emitter: Arc<dyn TerminalEventEmitter> = Arc::new(DaemonTerminalEmitter { connections: Arc::clone(&connections) });

        // `NotificationDispatcher` needs a fully-built `TerminalManager` to
        // broadcast into, but `TerminalManager` takes its matcher feed at
        // construction time. Break the cycle with a lazily-filled cell: the
        // feed closure forwards to whatever gets stored in it once the
        // dispatcher exists, a moment later in this same function.
        let notification_cell: Arc<OnceLock<Arc<NotificationDispatcher>>> = Arc::new(OnceLock::new());
        let matcher_feed: MatcherFeed = {
            let cell = Arc::clone(&notification_cell);
            Arc::new(move |session_id, chunk| {
                if let Some(dispatcher) = cell.get() {
                    let dispatcher = Arc::clone(dispatcher);
                    tokio::spawn(async move {
                        dispatcher.feed(session_id, chunk).await;
                    });
                }
            })
        };

        let terminal = Arc::new(TerminalManager::new(Arc::clone(&sessions), tmux.clone(), fifo_dir, terminal_emitter, matcher_feed));

        let notification_dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&terminal),
            Arc::new(notifications::pattern_compiler(&config)),
        ));
        notification_cell.set(Arc::clone(&notification_dispatcher)).map_err(|_| anyhow::anyhow!("notification cell already set"))?;

        let clipboard_temp_dir = std::env::temp_dir();
        let clipboard_emitter: Arc<dyn ClipboardEventEmitter> = Arc::new(DaemonClipboardEmitter { connections: Arc::clone(&connections) });
        let clipboard = ClipboardManager::new(
            Arc::clone(&sessions),
            tmux.clone(),
            clipboard_temp_dir,
            clipboard_emitter,
            config.max_image_size,
            config.text_paste_approval_threshold,
        );
        clipboard.attach_self().await;
        clipboard.clean_stale_files().await;

        wire::register_all(&dispatcher, Arc::clone(&connections), Arc::clone(&sessions), Arc::clone(&terminal), Arc::clone(&clipboard)).await;

        connections.start_keep_alive().await;

        {
            let mut started = relay_tasks.lock().await;
            started.extend(Self::spawn_relay_reconnection_for_paired_devices(&config, &devices, &connections, &message_sink).await);
        }

        let mut tasks = Vec::new();
        tasks.push(Self::bind_http_signaling(&config, Arc::clone(&pairing_coordinator))?);
        tasks.push(Self::bind_lan_ws(&config, Arc::clone(&devices), Arc::clone(&connections), Arc::clone(&message_sink)).await?);
        tasks.push(Self::bind_vpn_udp(&config, Arc::clone(&devices), Arc::clone(&connections), Arc::clone(&message_sink)).await?);
        tasks.push(Self::spawn_pairing_sweep(Arc::clone(&pairing_coordinator)));

        Ok(Arc::new(Self {
            config,
            connections,
            dispatcher,
            devices,
            pairing: pairing_coordinator,
            sessions,
            terminal,
            notifications: notification_dispatcher,
            clipboard,
            tasks: TokioMutex::new(tasks),
            relay_tasks,
        }))
    }

    /// Spawn one relay-reconnection listener per device already in the
    /// store, so a device that paired in a previous run can still be
    /// reached over the relay after a daemon restart.
    async fn spawn_relay_reconnection_for_paired_devices(
        config: &Config,
        devices: &Arc<TokioMutex<DeviceStore>>,
        connections: &Arc<ConnectionManager>,
        message_sink: &pairing::MessageSink,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let known: Vec<(String, crate::crypto::MasterSecret)> =
            devices.lock().await.iter().map(|d| (d.device_id.clone(), d.master_secret)).collect();

        known
            .into_iter()
            .map(|(device_id, master_secret)| {
                tokio::spawn(relay::serve_device(
                    config.relay_server_url.clone(),
                    device_id,
                    master_secret,
                    Arc::clone(devices),
                    Arc::clone(connections),
                    Arc::clone(message_sink),
                ))
            })
            .collect()
    }

    fn bind_http_signaling(config: &Config, coordinator: Arc<PairingCoordinator>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let addr = config.http_signaling_bind;
        let backend = Arc::new(HttpSignalAdapter::new(coordinator));
        let router = pairing::http_signal::router(backend);
        Ok(tokio::spawn(async move {
            if let Err(e) = serve_axum(addr, router).await {
                log::error!("direct HTTP signaling listener on {addr} stopped: {e:#}");
            }
        }))
    }

    async fn bind_lan_ws(
        config: &Config,
        devices: Arc<TokioMutex<DeviceStore>>,
        connections: Arc<ConnectionManager>,
        message_sink: pairing::MessageSink,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let addr = config.lan_ws_bind;
        let state = Arc::new(lan_ws::LanWsState { devices, connections, message_sink });
        let router = lan_ws::router(state);
        Ok(tokio::spawn(async move {
            if let Err(e) = serve_axum(addr, router).await {
                log::error!("LAN-direct WebSocket listener on {addr} stopped: {e:#}");
            }
        }))
    }

    async fn bind_vpn_udp(
        config: &Config,
        devices: Arc<TokioMutex<DeviceStore>>,
        connections: Arc<ConnectionManager>,
        message_sink: pairing::MessageSink,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let listener = Arc::new(VpnUdpListener::bind(config.vpn_udp_bind, devices).await?);
        Ok(tokio::spawn(async move {
            if let Err(e) = vpn_udp::serve(listener, connections, message_sink).await {
                log::error!("VPN-direct UDP listener stopped: {e:#}");
            }
        }))
    }

    fn spawn_pairing_sweep(coordinator: Arc<PairingCoordinator>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                coordinator.sweep_expired().await;
            }
        })
    }

    /// Cancel every background task and close every connection in parallel.
    /// Idempotent: a second call finds nothing left to do.
    pub async fn shutdown(&self) {
        log::info!("shutting down orchestrator");
        self.connections.close_all().await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        let mut relay_tasks = self.relay_tasks.lock().await;
        for task in relay_tasks.drain(..) {
            task.abort();
        }
    }
}

async fn serve_axum(addr: SocketAddr, router: axum::Router) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

/// Read the daemon's stable identity from `{config_dir}/rasd/daemon_id`,
/// generating and persisting one on first run.
fn load_or_create_daemon_id() -> anyhow::Result<String> {
    let dir = Config::config_dir()?.join("rasd");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("daemon_id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id)?;
    Ok(id)
}
