//! Clipboard transfer state machine: one in-flight image transfer per
//! daemon, plus stateless text-paste handling.
//!
//! States: `idle -> receiving -> assembling -> pasting -> complete | failed | cancelled`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clipboard::platform;
use crate::constants::{CLIPBOARD_PASTE_TIMEOUT, IMAGE_TEMP_FILE_PREFIX, IMAGE_TRANSFER_INACTIVITY_TIMEOUT, STALE_IMAGE_FILE_AGE, TEXT_PASTE_PREVIEW_LEN};
use crate::errors::ClipboardError;
use crate::sessions::SessionManager;
use crate::tmux::Tmux;

#[derive(Debug, Clone)]
pub enum ClipboardEvent {
    Progress { transfer_id: String, received_chunks: u32, total_chunks: u32 },
    Complete { transfer_id: String, content_type: ContentType },
    Error { transfer_id: String, code: &'static str, message: String },
    Cancelled { transfer_id: String },
    ApprovalRequired { size: usize, preview: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Image,
    Text,
}

#[async_trait]
pub trait ClipboardEventEmitter: Send + Sync {
    async fn emit(&self, device_id: &str, event: ClipboardEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Receiving,
    Assembling,
    Pasting,
}

struct Transfer {
    transfer_id: String,
    device_id: String,
    session_id: String,
    format: String,
    total_size: usize,
    total_chunks: u32,
    chunks: HashMap<u32, Vec<u8>>,
    state: TransferState,
    timeout_task: Option<JoinHandle<()>>,
}

pub struct ClipboardManager {
    sessions: Arc<SessionManager>,
    tmux: Tmux,
    temp_dir: PathBuf,
    events: Arc<dyn ClipboardEventEmitter>,
    max_image_size: u64,
    text_paste_approval_threshold: usize,
    current: Mutex<Option<Transfer>>,
    inactivity_timeout: Duration,
    self_handle: Arc<Mutex<Option<Arc<ClipboardManager>>>>,
}

impl std::fmt::Debug for ClipboardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipboardManager").finish_non_exhaustive()
    }
}

impl ClipboardManager {
    pub fn new(
        sessions: Arc<SessionManager>,
        tmux: Tmux,
        temp_dir: PathBuf,
        events: Arc<dyn ClipboardEventEmitter>,
        max_image_size: u64,
        text_paste_approval_threshold: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            tmux,
            temp_dir,
            events,
            max_image_size,
            text_paste_approval_threshold,
            current: Mutex::new(None),
            inactivity_timeout: IMAGE_TRANSFER_INACTIVITY_TIMEOUT,
            self_handle: Arc::new(Mutex::new(None)),
        })
    }

    /// Wire the manager's own `Arc` in so the inactivity-timeout task can
    /// call back into it. Must be called once right after construction.
    pub async fn attach_self(self: &Arc<Self>) {
        *self.self_handle.lock().await = Some(Arc::clone(self));
    }

    /// Remove `ras-image-*` temp files older than the staleness window.
    pub async fn clean_stale_files(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.temp_dir).await else { return };
        let now = std::time::SystemTime::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(IMAGE_TEMP_FILE_PREFIX) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            if now.duration_since(modified).unwrap_or_default() > STALE_IMAGE_FILE_AGE {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    pub async fn image_start(
        &self,
        device_id: &str,
        session_id: &str,
        transfer_id: String,
        total_size: usize,
        format: String,
        total_chunks: u32,
    ) -> Result<(), ClipboardError> {
        let mut current = self.current.lock().await;
        if current.is_some() {
            return Err(ClipboardError::TransferInProgress);
        }
        if total_size == 0 || total_size as u64 > self.max_image_size {
            return Err(ClipboardError::SizeExceeded);
        }
        if format.trim().is_empty() {
            return Err(ClipboardError::InvalidFormat);
        }
        if total_chunks == 0 {
            return Err(ClipboardError::InvalidChunk);
        }

        let timeout_task = self.spawn_inactivity_timeout(transfer_id.clone());
        *current = Some(Transfer {
            transfer_id,
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            format,
            total_size,
            total_chunks,
            chunks: HashMap::new(),
            state: TransferState::Receiving,
            timeout_task: Some(timeout_task),
        });
        Ok(())
    }

    pub async fn image_chunk(&self, transfer_id: &str, index: u32, data: Vec<u8>) -> Result<(), ClipboardError> {
        let mut current = self.current.lock().await;
        let Some(transfer) = current.as_mut() else { return Err(ClipboardError::InvalidChunk) };
        if transfer.transfer_id != transfer_id {
            // Late arrival for a transfer we've already moved past; drop silently.
            return Ok(());
        }
        if transfer.state != TransferState::Receiving {
            return Ok(());
        }
        if index >= transfer.total_chunks {
            self.fail_locked(&mut current, ClipboardError::InvalidChunk, "chunk index out of range").await;
            return Err(ClipboardError::InvalidChunk);
        }

        let remaining: usize = transfer.total_size.saturating_sub(transfer.chunks.values().map(|c| c.len()).sum());
        if data.len() > remaining && transfer.chunks.len() as u32 + 1 < transfer.total_chunks {
            self.fail_locked(&mut current, ClipboardError::InvalidChunk, "chunk oversized for declared total_size").await;
            return Err(ClipboardError::InvalidChunk);
        }

        let transfer = current.as_mut().expect("checked above");
        transfer.chunks.insert(index, data);
        if let Some(task) = transfer.timeout_task.take() {
            task.abort();
        }
        transfer.timeout_task = Some(self.spawn_inactivity_timeout(transfer.transfer_id.clone()));

        let received_chunks = transfer.chunks.len() as u32;
        let total_chunks = transfer.total_chunks;
        let device_id = transfer.device_id.clone();
        let transfer_id = transfer.transfer_id.clone();
        self.events.emit(&device_id, ClipboardEvent::Progress { transfer_id, received_chunks, total_chunks }).await;

        if received_chunks == total_chunks {
            self.assemble_and_paste(&mut current).await;
        }
        Ok(())
    }

    async fn assemble_and_paste(&self, current: &mut Option<Transfer>) {
        let transfer = current.as_mut().expect("caller holds Some");
        transfer.state = TransferState::Assembling;

        let mut bytes = Vec::with_capacity(transfer.total_size);
        for index in 0..transfer.total_chunks {
            match transfer.chunks.get(&index) {
                Some(chunk) => bytes.extend_from_slice(chunk),
                None => {
                    self.fail_locked(current, ClipboardError::ChunkMissing, "assembly is missing a chunk").await;
                    return;
                }
            }
        }
        if bytes.len() != transfer.total_size {
            self.fail_locked(current, ClipboardError::SizeExceeded, "assembled size does not match declared total_size").await;
            return;
        }

        transfer.state = TransferState::Pasting;
        let device_id = transfer.device_id.clone();
        let session_id = transfer.session_id.clone();
        let transfer_id = transfer.transfer_id.clone();
        let file_name = format!("{IMAGE_TEMP_FILE_PREFIX}{}.{}", short_id(&transfer_id), transfer.format);
        let path = self.temp_dir.join(file_name);

        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            self.fail_locked(current, ClipboardError::ClipboardFailed, &format!("writing image temp file failed: {e}")).await;
            return;
        }

        let paste_result = self.paste_image_or_send_path(&session_id, &path).await;
        if let Err(e) = paste_result {
            self.fail_locked(current, ClipboardError::PasteFailed, &format!("{e}")).await;
            return;
        }

        self.events.emit(&device_id, ClipboardEvent::Complete { transfer_id, content_type: ContentType::Image }).await;
        *current = None;
    }

    async fn paste_image_or_send_path(&self, session_id: &str, path: &std::path::Path) -> anyhow::Result<()> {
        let mux_name = self.sessions.get(session_id).await.map(|r| r.mux_name).context("session vanished mid-transfer")?;
        match platform::set_image(path) {
            Ok(()) => {
                let tmux = self.tmux.clone();
                let key = platform::paste_key_name().to_string();
                tokio::task::spawn_blocking(move || tmux.send_named_key(&mux_name, &key)).await.context("paste task panicked")??;
            }
            Err(e) => {
                log::warn!("no OS clipboard image backend available ({e}); sending file path to terminal instead");
                let tmux = self.tmux.clone();
                let text = format!("{}\n", path.display());
                tokio::task::spawn_blocking(move || tmux.send_keys(&mux_name, text.as_bytes())).await.context("send path task panicked")??;
            }
        }
        Ok(())
    }

    pub async fn image_cancel(&self, transfer_id: &str) -> Option<()> {
        let mut current = self.current.lock().await;
        if current.as_ref().map(|t| t.transfer_id.as_str()) != Some(transfer_id) {
            return None;
        }
        let transfer = current.take()?;
        if let Some(task) = transfer.timeout_task {
            task.abort();
        }
        self.events.emit(&transfer.device_id, ClipboardEvent::Cancelled { transfer_id: transfer.transfer_id }).await;
        Some(())
    }

    pub async fn text_paste(&self, device_id: &str, session_id: &str, text: &str) -> Result<(), ClipboardError> {
        if text.is_empty() {
            return Err(ClipboardError::InvalidFormat);
        }
        if text.len() > self.text_paste_approval_threshold {
            let preview: String = text.chars().take(TEXT_PASTE_PREVIEW_LEN).collect();
            self.events.emit(device_id, ClipboardEvent::ApprovalRequired { size: text.len(), preview }).await;
            return Ok(());
        }
        self.paste_text_now(session_id, text).await
    }

    pub async fn text_paste_approved(&self, session_id: &str, text: &str) -> Result<(), ClipboardError> {
        self.paste_text_now(session_id, text).await
    }

    async fn paste_text_now(&self, session_id: &str, text: &str) -> Result<(), ClipboardError> {
        let mux_name = self.sessions.get(session_id).await.ok_or(ClipboardError::ClipboardFailed)?.mux_name;
        platform::set_text(text).map_err(|_| ClipboardError::ClipboardFailed)?;
        let tmux = self.tmux.clone();
        let key = platform::paste_key_name().to_string();
        tokio::task::spawn_blocking(move || tmux.send_named_key(&mux_name, &key))
            .await
            .map_err(|_| ClipboardError::PasteFailed)?
            .map_err(|_| ClipboardError::PasteFailed)?;
        Ok(())
    }

    async fn fail_locked(&self, current: &mut Option<Transfer>, code: ClipboardError, message: &str) {
        if let Some(transfer) = current.take() {
            if let Some(task) = transfer.timeout_task {
                task.abort();
            }
            self.events
                .emit(&transfer.device_id, ClipboardEvent::Error { transfer_id: transfer.transfer_id, code: code.code(), message: message.to_string() })
                .await;
        }
    }

    fn spawn_inactivity_timeout(&self, transfer_id: String) -> JoinHandle<()> {
        let timeout = self.inactivity_timeout;
        let handle_slot = Arc::clone(&self.self_handle);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = handle_slot.lock().await.clone() {
                manager.expire_transfer(&transfer_id).await;
            }
        })
    }

    async fn expire_transfer(&self, transfer_id: &str) {
        let mut current = self.current.lock().await;
        if current.as_ref().map(|t| t.transfer_id.as_str()) == Some(transfer_id) {
            self.fail_locked(&mut current, ClipboardError::TransferTimeout, "no chunk received within the inactivity window").await;
        }
    }
}

/// First 8 hex-ish characters of a transfer id, used as the temp file's
/// distinguishing suffix.
fn short_id(transfer_id: &str) -> String {
    transfer_id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sessions::SessionEventEmitter;

    struct NullSessionEmitter;
    #[async_trait]
    impl SessionEventEmitter for NullSessionEmitter {
        async fn emit(&self, _event: crate::sessions::SessionEvent) {}
    }

    struct RecordingClipboardEmitter(Mutex<Vec<(String, ClipboardEvent)>>);
    #[async_trait]
    impl ClipboardEventEmitter for RecordingClipboardEmitter {
        async fn emit(&self, device_id: &str, event: ClipboardEvent) {
            self.0.lock().await.push((device_id.to_string(), event));
        }
    }

    async fn manager() -> Arc<ClipboardManager> {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionManager::new(dir.path().join("sessions.json"), Config::default(), Arc::new(NullSessionEmitter)).unwrap());
        let events = Arc::new(RecordingClipboardEmitter(Mutex::new(Vec::new())));
        ClipboardManager::new(sessions, Tmux::new("tmux"), dir.path().to_path_buf(), events, 1024 * 1024, 100)
    }

    #[tokio::test]
    async fn image_start_rejects_a_second_concurrent_transfer() {
        let manager = manager().await;
        manager.image_start("dev1", "sess1", "t1".into(), 100, "png".into(), 2).await.unwrap();
        let result = manager.image_start("dev1", "sess1", "t2".into(), 100, "png".into(), 2).await;
        assert_eq!(result, Err(ClipboardError::TransferInProgress));
    }

    #[tokio::test]
    async fn image_start_rejects_oversized_transfers() {
        let manager = manager().await;
        let result = manager.image_start("dev1", "sess1", "t1".into(), 2 * 1024 * 1024, "png".into(), 1).await;
        assert_eq!(result, Err(ClipboardError::SizeExceeded));
    }

    #[tokio::test]
    async fn image_chunk_with_no_transfer_is_rejected() {
        let manager = manager().await;
        let result = manager.image_chunk("missing", 0, vec![1, 2, 3]).await;
        assert_eq!(result, Err(ClipboardError::InvalidChunk));
    }

    #[tokio::test]
    async fn text_paste_rejects_empty_text() {
        let manager = manager().await;
        let result = manager.text_paste("dev1", "sess1", "").await;
        assert_eq!(result, Err(ClipboardError::InvalidFormat));
    }

    #[tokio::test]
    async fn image_cancel_on_unknown_transfer_is_a_noop() {
        let manager = manager().await;
        assert!(manager.image_cancel("nope").await.is_none());
    }
}
