//! Command payloads carried under the dispatcher's `session`/`terminal`/
//! `clipboard`/`ping`/`connection_ready` variants, and the handler
//! registrations that bind them to the session/terminal/clipboard managers.
//!
//! Each payload is shaped `{ "action": "...", ...fields }`; the dispatcher
//! already peeled off the outer `{ "type": "..." }` envelope (see
//! `dispatcher::CommandEnvelope`), so handlers here only ever see the inner
//! object.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::clipboard::ClipboardManager;
use crate::connection_manager::ConnectionManager;
use crate::dispatcher::Dispatcher;
use crate::sessions::SessionManager;
use crate::terminal::{InputElement, KeyType, TerminalManager};

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    code: &'a str,
}

async fn send(connections: &ConnectionManager, device_id: &str, value: &impl Serialize) {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            if let Err(e) = connections.send(device_id, &bytes).await {
                log::warn!("failed to send response to {device_id}: {e:#}");
            }
        }
        Err(e) => log::error!("failed to serialize response for {device_id}: {e:#}"),
    }
}

async fn send_error(connections: &ConnectionManager, device_id: &str, kind: &str, code: &str) {
    send(connections, device_id, &ErrorResponse { kind, code }).await;
}

// ============================================================================
// `ping` / `connection_ready`
// ============================================================================

#[derive(Debug, Serialize)]
struct Pong {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct SessionListResult {
    #[serde(rename = "type")]
    kind: &'static str,
    sessions: Vec<crate::sessions::SessionRecord>,
}

async fn register_ping(dispatcher: &Dispatcher, connections: Arc<ConnectionManager>) {
    dispatcher
        .register(
            "ping",
            Arc::new(move |device_id: String, _payload: serde_json::Value| {
                let connections = Arc::clone(&connections);
                Box::pin(async move {
                    send(&connections, &device_id, &Pong { kind: "pong" }).await;
                })
            }),
        )
        .await;
}

async fn register_connection_ready(
    dispatcher: &Dispatcher,
    connections: Arc<ConnectionManager>,
    sessions: Arc<SessionManager>,
) {
    dispatcher
        .register(
            "connection_ready",
            Arc::new(move |device_id: String, _payload: serde_json::Value| {
                let connections = Arc::clone(&connections);
                let sessions = Arc::clone(&sessions);
                Box::pin(async move {
                    match sessions.list().await {
                        Ok(records) => {
                            send(&connections, &device_id, &SessionListResult { kind: "session_list", sessions: records }).await;
                        }
                        Err(e) => {
                            log::warn!("session reconciliation failed for {device_id}: {e:#}");
                            send_error(&connections, &device_id, "session_error", "TMUX_ERROR").await;
                        }
                    }
                })
            }),
        )
        .await;
}

// ============================================================================
// `session`
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum SessionCommand {
    Create { agent: String, directory: String, display_name: String },
    List,
    Kill { id: String },
    Rename { id: String, display_name: String },
    GetAgents,
    GetDirectories,
}

#[derive(Debug, Serialize)]
struct AgentsResult {
    #[serde(rename = "type")]
    kind: &'static str,
    agents: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DirectoriesResult {
    #[serde(rename = "type")]
    kind: &'static str,
    directories: Vec<String>,
}

async fn register_session(
    dispatcher: &Dispatcher,
    connections: Arc<ConnectionManager>,
    sessions: Arc<SessionManager>,
) {
    dispatcher
        .register(
            "session",
            Arc::new(move |device_id: String, payload: serde_json::Value| {
                let connections = Arc::clone(&connections);
                let sessions = Arc::clone(&sessions);
                Box::pin(async move { handle_session(&connections, &sessions, &device_id, payload).await })
            }),
        )
        .await;
}

async fn handle_session(connections: &ConnectionManager, sessions: &SessionManager, device_id: &str, payload: serde_json::Value) {
    let command: SessionCommand = match serde_json::from_value(payload) {
        Ok(command) => command,
        Err(e) => {
            log::warn!("malformed session command from {device_id}: {e}");
            send_error(connections, device_id, "session_error", "INVALID_REQUEST").await;
            return;
        }
    };

    match command {
        SessionCommand::Create { agent, directory, display_name } => {
            if let Err(e) = sessions.create(device_id, &agent, &directory, &display_name).await {
                send_error(connections, device_id, "session_error", e.code()).await;
            }
        }
        SessionCommand::List => match sessions.list().await {
            Ok(records) => send(connections, device_id, &SessionListResult { kind: "session_list", sessions: records }).await,
            Err(e) => {
                log::warn!("session list failed for {device_id}: {e:#}");
                send_error(connections, device_id, "session_error", "TMUX_ERROR").await;
            }
        },
        SessionCommand::Kill { id } => {
            if let Err(e) = sessions.kill(&id).await {
                send_error(connections, device_id, "session_error", e.code()).await;
            }
        }
        SessionCommand::Rename { id, display_name } => {
            if let Err(e) = sessions.rename(&id, &display_name).await {
                send_error(connections, device_id, "session_error", e.code()).await;
            }
        }
        SessionCommand::GetAgents => {
            send(connections, device_id, &AgentsResult { kind: "session_agents", agents: sessions.get_agents().await }).await;
        }
        SessionCommand::GetDirectories => {
            send(connections, device_id, &DirectoriesResult { kind: "session_directories", directories: sessions.get_directories().await }).await;
        }
    }
}

// ============================================================================
// `terminal`
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireKeyType {
    Enter,
    Tab,
    Backspace,
    Escape,
    Delete,
    Insert,
    Up,
    Down,
    Right,
    Left,
    Home,
    End,
    PageUp,
    PageDown,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    CtrlC,
    CtrlD,
    CtrlZ,
}

impl From<WireKeyType> for KeyType {
    fn from(key: WireKeyType) -> Self {
        match key {
            WireKeyType::Enter => Self::Enter,
            WireKeyType::Tab => Self::Tab,
            WireKeyType::Backspace => Self::Backspace,
            WireKeyType::Escape => Self::Escape,
            WireKeyType::Delete => Self::Delete,
            WireKeyType::Insert => Self::Insert,
            WireKeyType::Up => Self::Up,
            WireKeyType::Down => Self::Down,
            WireKeyType::Right => Self::Right,
            WireKeyType::Left => Self::Left,
            WireKeyType::Home => Self::Home,
            WireKeyType::End => Self::End,
            WireKeyType::PageUp => Self::PageUp,
            WireKeyType::PageDown => Self::PageDown,
            WireKeyType::F1 => Self::F1,
            WireKeyType::F2 => Self::F2,
            WireKeyType::F3 => Self::F3,
            WireKeyType::F4 => Self::F4,
            WireKeyType::F5 => Self::F5,
            WireKeyType::F6 => Self::F6,
            WireKeyType::F7 => Self::F7,
            WireKeyType::F8 => Self::F8,
            WireKeyType::F9 => Self::F9,
            WireKeyType::F10 => Self::F10,
            WireKeyType::F11 => Self::F11,
            WireKeyType::F12 => Self::F12,
            WireKeyType::CtrlC => Self::CtrlC,
            WireKeyType::CtrlD => Self::CtrlD,
            WireKeyType::CtrlZ => Self::CtrlZ,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireInputElement {
    Text { text: String },
    Key { key: WireKeyType, #[serde(default)] modifiers: u8 },
}

impl From<WireInputElement> for InputElement {
    fn from(element: WireInputElement) -> Self {
        match element {
            WireInputElement::Text { text } => Self::Text(text),
            WireInputElement::Key { key, modifiers } => Self::Key { key_type: key.into(), modifiers },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum TerminalCommand {
    Attach { session_id: String, from_sequence: Option<u64> },
    Detach { session_id: String },
    Input { session_id: String, elements: Vec<WireInputElement> },
}

async fn register_terminal(
    dispatcher: &Dispatcher,
    connections: Arc<ConnectionManager>,
    terminal: Arc<TerminalManager>,
) {
    dispatcher
        .register(
            "terminal",
            Arc::new(move |device_id: String, payload: serde_json::Value| {
                let connections = Arc::clone(&connections);
                let terminal = Arc::clone(&terminal);
                Box::pin(async move { handle_terminal(&connections, &terminal, &device_id, payload).await })
            }),
        )
        .await;
}

async fn handle_terminal(connections: &ConnectionManager, terminal: &TerminalManager, device_id: &str, payload: serde_json::Value) {
    let command: TerminalCommand = match serde_json::from_value(payload) {
        Ok(command) => command,
        Err(e) => {
            log::warn!("malformed terminal command from {device_id}: {e}");
            send_error(connections, device_id, "terminal_error", "INVALID_REQUEST").await;
            return;
        }
    };

    match command {
        TerminalCommand::Attach { session_id, from_sequence } => {
            if let Err(e) = terminal.attach(&session_id, device_id, from_sequence).await {
                send_error(connections, device_id, "terminal_error", e.code()).await;
            }
        }
        TerminalCommand::Detach { session_id } => {
            terminal.detach(&session_id, device_id).await;
        }
        TerminalCommand::Input { session_id, elements } => {
            let elements: Vec<InputElement> = elements.into_iter().map(Into::into).collect();
            if let Err(e) = terminal.input(&session_id, device_id, elements).await {
                send_error(connections, device_id, "terminal_error", e.code()).await;
            }
        }
    }
}

// ============================================================================
// `clipboard`
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClipboardCommand {
    ImageStart { session_id: String, transfer_id: String, total_size: usize, format: String, total_chunks: u32 },
    ImageChunk { transfer_id: String, index: u32, data: String },
    ImageCancel { transfer_id: String },
    TextPaste { session_id: String, text: String },
    TextPasteApproved { session_id: String, text: String },
}

async fn register_clipboard(
    dispatcher: &Dispatcher,
    connections: Arc<ConnectionManager>,
    clipboard: Arc<ClipboardManager>,
) {
    dispatcher
        .register(
            "clipboard",
            Arc::new(move |device_id: String, payload: serde_json::Value| {
                let connections = Arc::clone(&connections);
                let clipboard = Arc::clone(&clipboard);
                Box::pin(async move { handle_clipboard(&connections, &clipboard, &device_id, payload).await })
            }),
        )
        .await;
}

async fn handle_clipboard(connections: &ConnectionManager, clipboard: &ClipboardManager, device_id: &str, payload: serde_json::Value) {
    let command: ClipboardCommand = match serde_json::from_value(payload) {
        Ok(command) => command,
        Err(e) => {
            log::warn!("malformed clipboard command from {device_id}: {e}");
            send_error(connections, device_id, "clipboard_error", "INVALID_FORMAT").await;
            return;
        }
    };

    match command {
        ClipboardCommand::ImageStart { session_id, transfer_id, total_size, format, total_chunks } => {
            if let Err(e) = clipboard.image_start(device_id, &session_id, transfer_id, total_size, format, total_chunks).await {
                send_error(connections, device_id, "clipboard_error", e.code()).await;
            }
        }
        ClipboardCommand::ImageChunk { transfer_id, index, data } => {
            let Ok(bytes) = BASE64.decode(data.as_bytes()) else {
                send_error(connections, device_id, "clipboard_error", "INVALID_CHUNK").await;
                return;
            };
            if let Err(e) = clipboard.image_chunk(&transfer_id, index, bytes).await {
                send_error(connections, device_id, "clipboard_error", e.code()).await;
            }
        }
        ClipboardCommand::ImageCancel { transfer_id } => {
            clipboard.image_cancel(&transfer_id).await;
        }
        ClipboardCommand::TextPaste { session_id, text } => {
            if let Err(e) = clipboard.text_paste(device_id, &session_id, &text).await {
                send_error(connections, device_id, "clipboard_error", e.code()).await;
            }
        }
        ClipboardCommand::TextPasteApproved { session_id, text } => {
            if let Err(e) = clipboard.text_paste_approved(&session_id, &text).await {
                send_error(connections, device_id, "clipboard_error", e.code()).await;
            }
        }
    }
}

/// Register every command-variant handler the dispatcher routes to. Called
/// once by the orchestrator during startup wiring.
pub async fn register_all(
    dispatcher: &Dispatcher,
    connections: Arc<ConnectionManager>,
    sessions: Arc<SessionManager>,
    terminal: Arc<TerminalManager>,
    clipboard: Arc<ClipboardManager>,
) {
    register_ping(dispatcher, Arc::clone(&connections)).await;
    register_connection_ready(dispatcher, Arc::clone(&connections), Arc::clone(&sessions)).await;
    register_session(dispatcher, Arc::clone(&connections), sessions).await;
    register_terminal(dispatcher, Arc::clone(&connections), terminal).await;
    register_clipboard(dispatcher, connections, clipboard).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_key_type_converts_to_domain_key_type() {
        assert_eq!(KeyType::from(WireKeyType::Enter), KeyType::Enter);
        assert_eq!(KeyType::from(WireKeyType::CtrlC), KeyType::CtrlC);
        assert_eq!(KeyType::from(WireKeyType::F12), KeyType::F12);
    }

    #[test]
    fn wire_input_element_text_converts() {
        let wire: WireInputElement = serde_json::from_value(json!({"kind": "text", "text": "hi"})).unwrap();
        match InputElement::from(wire) {
            InputElement::Text(text) => assert_eq!(text, "hi"),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn wire_input_element_key_defaults_modifiers_to_zero() {
        let wire: WireInputElement = serde_json::from_value(json!({"kind": "key", "key": "enter"})).unwrap();
        match InputElement::from(wire) {
            InputElement::Key { key_type, modifiers } => {
                assert_eq!(key_type, KeyType::Enter);
                assert_eq!(modifiers, 0);
            }
            other => panic!("expected Key, got {other:?}"),
        }
    }

    #[test]
    fn session_command_parses_create() {
        let value = json!({
            "action": "create",
            "agent": "claude",
            "directory": "/tmp/project",
            "display_name": "my session",
        });
        let command: SessionCommand = serde_json::from_value(value).unwrap();
        match command {
            SessionCommand::Create { agent, directory, display_name } => {
                assert_eq!(agent, "claude");
                assert_eq!(directory, "/tmp/project");
                assert_eq!(display_name, "my session");
            }
            other => panic!("expected Create, got {other:?}"),
        }
    }

    #[test]
    fn session_command_rejects_unknown_action() {
        let value = json!({"action": "explode"});
        let result: Result<SessionCommand, _> = serde_json::from_value(value);
        assert!(result.is_err());
    }

    #[test]
    fn terminal_command_parses_attach_without_from_sequence() {
        let value = json!({"action": "attach", "session_id": "abc123"});
        let command: TerminalCommand = serde_json::from_value(value).unwrap();
        match command {
            TerminalCommand::Attach { session_id, from_sequence } => {
                assert_eq!(session_id, "abc123");
                assert_eq!(from_sequence, None);
            }
            other => panic!("expected Attach, got {other:?}"),
        }
    }

    #[test]
    fn terminal_command_parses_input_with_elements() {
        let value = json!({
            "action": "input",
            "session_id": "abc123",
            "elements": [
                {"kind": "text", "text": "ls\n"},
                {"kind": "key", "key": "ctrl_c", "modifiers": 0},
            ],
        });
        let command: TerminalCommand = serde_json::from_value(value).unwrap();
        match command {
            TerminalCommand::Input { elements, .. } => assert_eq!(elements.len(), 2),
            other => panic!("expected Input, got {other:?}"),
        }
    }

    #[test]
    fn clipboard_command_parses_image_start() {
        let value = json!({
            "action": "image_start",
            "session_id": "abc123",
            "transfer_id": "xfer-1",
            "total_size": 1024,
            "format": "png",
            "total_chunks": 4,
        });
        let command: ClipboardCommand = serde_json::from_value(value).unwrap();
        matches!(command, ClipboardCommand::ImageStart { .. });
    }

    #[test]
    fn clipboard_command_rejects_malformed_payload() {
        let value = json!({"action": "image_chunk", "transfer_id": "xfer-1"});
        let result: Result<ClipboardCommand, _> = serde_json::from_value(value);
        assert!(result.is_err());
    }
}
