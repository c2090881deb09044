use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{SessionError, TerminalError};
use crate::sessions::{SessionManager, SessionState};
use crate::terminal::buffer::OutputBuffer;
use crate::terminal::capture::Capture;
use crate::terminal::control_mode::{ControlCommand, ControlModeState, ControlOutcome};
use crate::terminal::keys::{self, KeyType};
use crate::tmux::Tmux;

/// Routes raw output chunks to the notification matcher, independent of the
/// per-connection fan-out `TerminalEventEmitter` handles.
pub type MatcherFeed = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    UserRequest,
    SessionKilled,
    ConnectionClosed,
}

#[derive(Debug, Clone)]
pub enum TerminalEvent {
    Attached { session_id: String, buffer_start_sequence: u64, current_sequence: u64 },
    OutputSkipped { session_id: String, requested_sequence: u64, resumed_at_sequence: u64 },
    Output { session_id: String, data: Vec<u8>, sequence: u64 },
    Detached { session_id: String, reason: DetachReason },
    Notification { session_id: String, kind: &'static str, title: String, body: String, snippet: String, timestamp_ms: u64 },
}

#[async_trait]
pub trait TerminalEventEmitter: Send + Sync {
    async fn emit(&self, device_id: &str, event: TerminalEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    Session(SessionError),
    Terminal(TerminalError),
}

impl AttachError {
    pub fn code(self) -> &'static str {
        match self {
            Self::Session(e) => e.code(),
            Self::Terminal(e) => e.code(),
        }
    }
}

#[derive(Debug)]
pub enum InputElement {
    Text(String),
    Key { key_type: KeyType, modifiers: u8 },
}

struct SessionTerminalState {
    buffer: OutputBuffer,
    capture: Option<Capture>,
    attachments: HashSet<String>,
    control_modes: HashMap<String, ControlModeState>,
}

impl SessionTerminalState {
    fn new() -> Self {
        Self { buffer: OutputBuffer::new(), capture: None, attachments: HashSet::new(), control_modes: HashMap::new() }
    }
}

pub struct TerminalManager {
    sessions: Arc<SessionManager>,
    tmux: Tmux,
    fifo_dir: PathBuf,
    events: Arc<dyn TerminalEventEmitter>,
    matcher_feed: MatcherFeed,
    state: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<SessionTerminalState>>>>,
}

impl std::fmt::Debug for TerminalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalManager").finish_non_exhaustive()
    }
}

impl TerminalManager {
    pub fn new(
        sessions: Arc<SessionManager>,
        tmux: Tmux,
        fifo_dir: PathBuf,
        events: Arc<dyn TerminalEventEmitter>,
        matcher_feed: MatcherFeed,
    ) -> Self {
        Self { sessions, tmux, fifo_dir, events, matcher_feed, state: tokio::sync::Mutex::new(HashMap::new()) }
    }

    pub async fn attach(&self, session_id: &str, device_id: &str, from_sequence: Option<u64>) -> Result<(), AttachError> {
        let record = self.sessions.get(session_id).await.ok_or(AttachError::Session(SessionError::SessionNotFound))?;
        if record.state == SessionState::Killing {
            return Err(AttachError::Session(SessionError::SessionKilling));
        }

        let session_state = {
            let mut sessions = self.state.lock().await;
            Arc::clone(sessions.entry(session_id.to_string()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(SessionTerminalState::new()))))
        };

        {
            let mut guard = session_state.lock().await;
            if guard.capture.is_none() {
                if self.sessions.get(session_id).await.is_none() {
                    self.state.lock().await.remove(session_id);
                    return Err(AttachError::Session(SessionError::SessionGone));
                }

                let capture_result = self.start_capture(session_id, &record.mux_name, Arc::clone(&session_state)).await;
                match capture_result {
                    Ok(capture) => guard.capture = Some(capture),
                    Err(_) => return Err(AttachError::Terminal(TerminalError::PipeSetupFailed)),
                }
            }

            guard.attachments.insert(device_id.to_string());
            guard.control_modes.entry(device_id.to_string()).or_insert_with(ControlModeState::default);

            let buffer_start_sequence = guard.buffer.start_sequence();
            let current_sequence = guard.buffer.current_sequence();

            let replay = from_sequence.map(|from_sequence| guard.buffer.replay_from(from_sequence));
            drop(guard);

            if let Some((skipped, chunks)) = replay {
                if let Some(skipped) = skipped {
                    self.events
                        .emit(
                            device_id,
                            TerminalEvent::OutputSkipped {
                                session_id: session_id.to_string(),
                                requested_sequence: skipped.requested_sequence,
                                resumed_at_sequence: skipped.resumed_at_sequence,
                            },
                        )
                        .await;
                }
                for chunk in chunks {
                    self.events
                        .emit(
                            device_id,
                            TerminalEvent::Output { session_id: session_id.to_string(), data: chunk.data, sequence: chunk.sequence },
                        )
                        .await;
                }
            }

            self.events
                .emit(device_id, TerminalEvent::Attached { session_id: session_id.to_string(), buffer_start_sequence, current_sequence })
                .await;
        }

        Ok(())
    }

    async fn start_capture(
        &self,
        session_id: &str,
        mux_name: &str,
        session_state: Arc<tokio::sync::Mutex<SessionTerminalState>>,
    ) -> anyhow::Result<Capture> {
        let events = Arc::clone(&self.events);
        let matcher_feed = Arc::clone(&self.matcher_feed);
        let session_id = session_id.to_string();

        Capture::start(self.tmux.clone(), mux_name, &self.fifo_dir, move |chunk| {
            let events = Arc::clone(&events);
            let matcher_feed = Arc::clone(&matcher_feed);
            let session_state = Arc::clone(&session_state);
            let session_id = session_id.clone();
            tokio::spawn(async move {
                matcher_feed(session_id.clone(), chunk.clone());

                let (sequence, attachments) = {
                    let mut guard = session_state.lock().await;
                    let sequence = guard.buffer.append(chunk.clone());
                    (sequence, guard.attachments.clone())
                };
                for device_id in attachments {
                    events
                        .emit(&device_id, TerminalEvent::Output { session_id: session_id.clone(), data: chunk.clone(), sequence })
                        .await;
                }
            });
        })
        .await
    }

    /// Emit `event` to every device currently attached to `session_id`.
    /// Used by the notification dispatcher, which has no single device in
    /// mind when a pattern fires.
    pub async fn broadcast(&self, session_id: &str, event: TerminalEvent) {
        let attachments = {
            let sessions = self.state.lock().await;
            match sessions.get(session_id) {
                Some(session_state) => session_state.lock().await.attachments.clone(),
                None => return,
            }
        };
        for device_id in attachments {
            self.events.emit(&device_id, event.clone()).await;
        }
    }

    pub async fn detach(&self, session_id: &str, device_id: &str) {
        self.detach_with_reason(session_id, device_id, DetachReason::UserRequest).await;
    }

    async fn detach_with_reason(&self, session_id: &str, device_id: &str, reason: DetachReason) {
        let Some(session_state) = self.state.lock().await.get(session_id).cloned() else { return };

        let should_stop_capture = {
            let mut guard = session_state.lock().await;
            guard.attachments.remove(device_id);
            guard.control_modes.remove(device_id);
            guard.attachments.is_empty()
        };

        self.events.emit(device_id, TerminalEvent::Detached { session_id: session_id.to_string(), reason }).await;

        if should_stop_capture {
            self.state.lock().await.remove(session_id);
            if let Some(mut capture) = session_state.lock().await.capture.take() {
                capture.stop().await;
            }
        }
    }

    pub async fn input(&self, session_id: &str, device_id: &str, elements: Vec<InputElement>) -> Result<(), TerminalError> {
        let attached = {
            let sessions = self.state.lock().await;
            match sessions.get(session_id) {
                Some(session_state) => session_state.lock().await.attachments.contains(device_id),
                None => false,
            }
        };
        if !attached {
            return Err(TerminalError::NotAttached);
        }

        let record = self.sessions.get(session_id).await.ok_or(TerminalError::NotAttached)?;
        let (bytes, commands) = self.encode_input(session_id, device_id, elements).await;

        for command in commands {
            self.run_control_command(session_id, device_id, command).await;
        }

        if bytes.is_empty() {
            return Ok(());
        }

        let tmux = self.tmux.clone();
        let mux_name = record.mux_name.clone();
        tokio::task::spawn_blocking(move || tmux.send_keys(&mux_name, &bytes))
            .await
            .map_err(|_| TerminalError::PipeSetupFailed)?
            .map_err(|_| TerminalError::PipeSetupFailed)?;
        Ok(())
    }

    /// Run text elements through the control-mode byte filter; key elements
    /// always pass straight through to the encoded-bytes stream. Recognized
    /// control commands are collected rather than acted on here, since
    /// acting on them (switching which session this device is attached to)
    /// needs `self.state` locks this function's caller no longer holds.
    async fn encode_input(&self, session_id: &str, device_id: &str, elements: Vec<InputElement>) -> (Vec<u8>, Vec<ControlCommand>) {
        let sessions = self.state.lock().await;
        let Some(session_state) = sessions.get(session_id).cloned() else { return (Vec::new(), Vec::new()) };
        drop(sessions);
        let mut guard = session_state.lock().await;
        let control_mode = guard.control_modes.entry(device_id.to_string()).or_insert_with(ControlModeState::default);

        let mut bytes = Vec::new();
        let mut commands = Vec::new();
        for element in elements {
            match element {
                InputElement::Key { key_type, modifiers } => bytes.extend(keys::encode(key_type, modifiers)),
                InputElement::Text(text) => {
                    for byte in text.into_bytes() {
                        match control_mode.feed(byte) {
                            ControlOutcome::PassThrough => bytes.push(byte),
                            ControlOutcome::AwaitingCommand | ControlOutcome::UnknownCommand => {}
                            ControlOutcome::Command(command) => commands.push(command),
                        }
                    }
                }
            }
        }
        (bytes, commands)
    }

    /// Act on a recognized control-mode command: detach, or move `device_id`
    /// from `session_id` to another session in `SessionManager::list`'s
    /// order. A target that doesn't exist (stale index, empty list, already
    /// on the target) is a silent no-op, matching the rest of this module's
    /// "drop invalid input" discipline.
    async fn run_control_command(&self, session_id: &str, device_id: &str, command: ControlCommand) {
        if command == ControlCommand::Detach {
            self.detach(session_id, device_id).await;
            return;
        }

        let Ok(sessions) = self.sessions.list().await else { return };
        if sessions.is_empty() {
            return;
        }
        let current_index = sessions.iter().position(|s| s.id == session_id);

        let target_index = match command {
            ControlCommand::NextSession => current_index.map(|i| (i + 1) % sessions.len()).unwrap_or(0),
            ControlCommand::PreviousSession => current_index.map(|i| (i + sessions.len() - 1) % sessions.len()).unwrap_or(0),
            ControlCommand::SwitchToIndex(n) => match (n as usize).checked_sub(1) {
                Some(i) if i < sessions.len() => i,
                _ => return,
            },
            ControlCommand::Detach => return,
        };

        let target_id = &sessions[target_index].id;
        if target_id == session_id {
            return;
        }

        self.detach(session_id, device_id).await;
        if let Err(e) = self.attach(target_id, device_id, None).await {
            log::debug!("control-mode switch of {device_id} to session {target_id} failed: {e:?}");
        }
    }

    /// Notify attachments, stop capture, clear buffer, reset rate limits.
    pub async fn session_killed(&self, session_id: &str) {
        let (device_ids, mut capture) = {
            let mut sessions = self.state.lock().await;
            let Some(session_state) = sessions.remove(session_id) else { return };
            let mut guard = session_state.lock().await;
            let device_ids: Vec<String> = guard.attachments.drain().collect();
            guard.buffer.clear();
            (device_ids, guard.capture.take())
        };

        if let Some(capture) = capture.as_mut() {
            capture.stop().await;
        }

        for device_id in device_ids {
            self.events
                .emit(&device_id, TerminalEvent::Detached { session_id: session_id.to_string(), reason: DetachReason::SessionKilled })
                .await;
        }
    }

    /// Remove a closed connection from every session's attachment set,
    /// stopping now-empty captures.
    pub async fn connection_closed(&self, device_id: &str) {
        let mut emptied = Vec::new();
        {
            let sessions = self.state.lock().await;
            for (session_id, session_state) in sessions.iter() {
                let mut guard = session_state.lock().await;
                if guard.attachments.remove(device_id) {
                    guard.control_modes.remove(device_id);
                    if guard.attachments.is_empty() {
                        emptied.push(session_id.clone());
                    }
                }
            }
        }

        for session_id in emptied {
            let captured = {
                let mut sessions = self.state.lock().await;
                sessions.remove(&session_id)
            };
            if let Some(session_state) = captured {
                if let Some(mut capture) = session_state.lock().await.capture.take() {
                    capture.stop().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex as StdMutex;

    struct RecordingEmitter {
        events: StdMutex<Vec<(String, TerminalEvent)>>,
    }

    #[async_trait]
    impl TerminalEventEmitter for RecordingEmitter {
        async fn emit(&self, device_id: &str, event: TerminalEvent) {
            self.events.lock().unwrap().push((device_id.to_string(), event));
        }
    }

    #[tokio::test]
    async fn attach_to_unknown_session_is_not_found() {
        let sessions_path = {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("sessions.json");
            std::mem::forget(dir);
            path
        };

        struct NullSessionEmitter;
        #[async_trait]
        impl crate::sessions::SessionEventEmitter for NullSessionEmitter {
            async fn emit(&self, _event: crate::sessions::SessionEvent) {}
        }

        let sessions = Arc::new(SessionManager::new(sessions_path, Config::default(), Arc::new(NullSessionEmitter)).unwrap());
        let emitter = Arc::new(RecordingEmitter { events: StdMutex::new(Vec::new()) });
        let fifo_dir = tempfile::tempdir().unwrap();
        let manager = TerminalManager::new(
            Arc::clone(&sessions),
            Tmux::new("tmux"),
            fifo_dir.path().to_path_buf(),
            emitter,
            Arc::new(|_session_id, _chunk| {}),
        );

        let result = manager.attach("nonexistent", "dev-1", None).await;
        assert_eq!(result.unwrap_err(), AttachError::Session(SessionError::SessionNotFound));
    }

    #[tokio::test]
    async fn input_rejects_when_not_attached() {
        let sessions_path = {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("sessions.json");
            std::mem::forget(dir);
            path
        };
        struct NullSessionEmitter;
        #[async_trait]
        impl crate::sessions::SessionEventEmitter for NullSessionEmitter {
            async fn emit(&self, _event: crate::sessions::SessionEvent) {}
        }
        let sessions = Arc::new(SessionManager::new(sessions_path, Config::default(), Arc::new(NullSessionEmitter)).unwrap());
        let emitter = Arc::new(RecordingEmitter { events: StdMutex::new(Vec::new()) });
        let fifo_dir = tempfile::tempdir().unwrap();
        let manager = TerminalManager::new(
            Arc::clone(&sessions),
            Tmux::new("tmux"),
            fifo_dir.path().to_path_buf(),
            emitter,
            Arc::new(|_session_id, _chunk| {}),
        );

        let result = manager.input("nonexistent", "dev-1", vec![InputElement::Text("hi".to_string())]).await;
        assert_eq!(result.unwrap_err(), TerminalError::NotAttached);
    }

    #[tokio::test]
    async fn control_mode_detach_command_detaches_the_device() {
        let sessions_path = {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("sessions.json");
            std::mem::forget(dir);
            path
        };
        struct NullSessionEmitter;
        #[async_trait]
        impl crate::sessions::SessionEventEmitter for NullSessionEmitter {
            async fn emit(&self, _event: crate::sessions::SessionEvent) {}
        }
        let sessions = Arc::new(SessionManager::new(sessions_path, Config::default(), Arc::new(NullSessionEmitter)).unwrap());
        let emitter = Arc::new(RecordingEmitter { events: StdMutex::new(Vec::new()) });
        let fifo_dir = tempfile::tempdir().unwrap();
        let manager = TerminalManager::new(
            Arc::clone(&sessions),
            Tmux::new("tmux"),
            fifo_dir.path().to_path_buf(),
            Arc::clone(&emitter) as Arc<dyn TerminalEventEmitter>,
            Arc::new(|_session_id, _chunk| {}),
        );

        let session_state = Arc::new(tokio::sync::Mutex::new(SessionTerminalState::new()));
        session_state.lock().await.attachments.insert("dev-1".to_string());
        manager.state.lock().await.insert("sess-1".to_string(), session_state);

        manager.run_control_command("sess-1", "dev-1", ControlCommand::Detach).await;

        let events = emitter.events.lock().unwrap();
        assert!(events.iter().any(|(device, event)| device == "dev-1" && matches!(event, TerminalEvent::Detached { .. })));
    }
}
