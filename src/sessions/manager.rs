use std::collections::{HashMap, VecDeque};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::errors::SessionError;
use crate::sessions::record::{SessionRecord, SessionState};
use crate::tmux::Tmux;

/// Bounded recency list of directories a session has successfully been
/// created in, most recent first.
const RECENT_DIRECTORIES_CAP: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentDirectories(VecDeque<String>);

impl RecentDirectories {
    fn remember(&mut self, dir: &str) {
        self.0.retain(|d| d != dir);
        self.0.push_front(dir.to_string());
        self.0.truncate(RECENT_DIRECTORIES_CAP);
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl Default for RecentDirectories {
    fn default() -> Self {
        Self(VecDeque::new())
    }
}

/// Emitted by the session manager on every state change. Broadcasting these
/// to connected clients is the connection manager's job, not this one's.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created(SessionRecord),
    Killed { id: String },
    Renamed { id: String, display_name: String },
    Error { code: &'static str, message: String },
}

#[async_trait]
pub trait SessionEventEmitter: Send + Sync {
    async fn emit(&self, event: SessionEvent);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredSessions {
    sessions: HashMap<String, SessionRecord>,
    #[serde(default)]
    recent_directories: RecentDirectories,
}

struct RateWindow {
    window_start: u64,
    count: u32,
}

pub struct SessionManager {
    path: PathBuf,
    config: Config,
    tmux: Tmux,
    emitter: Arc<dyn SessionEventEmitter>,
    state: Mutex<State>,
}

struct State {
    sessions: HashMap<String, SessionRecord>,
    recent_directories: RecentDirectories,
    rate_limits: HashMap<String, RateWindow>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(path: PathBuf, config: Config, emitter: Arc<dyn SessionEventEmitter>) -> Result<Self> {
        let stored = load_stored(&path)?;
        let tmux = Tmux::new(config.multiplexer_binary.clone());
        Ok(Self {
            path,
            config,
            tmux,
            emitter,
            state: Mutex::new(State {
                sessions: stored.sessions,
                recent_directories: stored.recent_directories,
                rate_limits: HashMap::new(),
            }),
        })
    }

    /// Load records, reconcile against the multiplexer's own session list:
    /// drop records whose `mux_name` vanished, adopt any mux session not
    /// already tracked.
    pub async fn initialize(&self) -> Result<()> {
        self.reconcile().await
    }

    /// Reconcile, then return sessions sorted by `last_activity_at` desc.
    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        self.reconcile().await?;
        let state = self.state.lock().await;
        let mut sessions: Vec<SessionRecord> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    async fn reconcile(&self) -> Result<()> {
        let mux_sessions = tokio::task::spawn_blocking({
            let tmux = self.tmux.clone();
            move || tmux.list_sessions()
        })
        .await
        .context("tmux list-sessions task panicked")??;
        let mux_names: std::collections::HashSet<String> = mux_sessions.iter().map(|s| s.name.clone()).collect();

        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, record| mux_names.contains(&record.mux_name));

        let tracked_names: std::collections::HashSet<String> =
            state.sessions.values().map(|r| r.mux_name.clone()).collect();
        let now = now_unix();
        for mux in &mux_sessions {
            if tracked_names.contains(&mux.name) {
                continue;
            }
            let id = generate_session_id();
            state.sessions.insert(
                id.clone(),
                SessionRecord {
                    id,
                    mux_name: mux.name.clone(),
                    agent: "unknown".to_string(),
                    directory: String::new(),
                    display_name: mux.name.clone(),
                    state: SessionState::Active,
                    created_at: now,
                    last_activity_at: now,
                },
            );
        }

        if before != state.sessions.len() || !mux_sessions.is_empty() {
            flush(&self.path, &state.sessions, &state.recent_directories)?;
        }
        Ok(())
    }

    pub async fn create(
        &self,
        device_id: &str,
        agent: &str,
        directory: &str,
        display_name: &str,
    ) -> Result<SessionRecord, SessionError> {
        self.validate_directory(directory)?;
        if !self.config.available_agents.iter().any(|a| a == agent) {
            return Err(SessionError::AgentNotFound);
        }

        let mut state = self.state.lock().await;
        if state.sessions.len() >= self.config.max_sessions {
            return Err(SessionError::MaxSessionsReached);
        }
        self.check_rate_limit(&mut state, device_id)?;

        let id = generate_session_id();
        let slug = slugify(directory);
        let mux_name = format!("ras-{agent}-{slug}");
        let now = now_unix();
        let mut record = SessionRecord {
            id: id.clone(),
            mux_name: mux_name.clone(),
            agent: agent.to_string(),
            directory: directory.to_string(),
            display_name: display_name.to_string(),
            state: SessionState::Creating,
            created_at: now,
            last_activity_at: now,
        };
        state.sessions.insert(id.clone(), record.clone());
        drop(state);

        let dir = PathBuf::from(directory);
        let spawn_result = tokio::task::spawn_blocking({
            let tmux = self.tmux.clone();
            let mux_name = mux_name.clone();
            let agent = agent.to_string();
            move || tmux.new_session(&mux_name, &dir, &agent)
        })
        .await;

        let mut state = self.state.lock().await;
        match spawn_result {
            Ok(Ok(())) => {
                record.state = SessionState::Active;
                state.sessions.insert(id.clone(), record.clone());
                state.recent_directories.remember(directory);
                if let Err(e) = flush(&self.path, &state.sessions, &state.recent_directories) {
                    log::error!("failed to persist session store: {e}");
                }
                drop(state);
                self.emitter.emit(SessionEvent::Created(record.clone())).await;
                Ok(record)
            }
            _ => {
                state.sessions.remove(&id);
                if let Err(e) = flush(&self.path, &state.sessions, &state.recent_directories) {
                    log::error!("failed to persist session store: {e}");
                }
                drop(state);
                self.emitter
                    .emit(SessionEvent::Error { code: SessionError::TmuxError.code(), message: format!("failed to create tmux session {mux_name}") })
                    .await;
                Err(SessionError::TmuxError)
            }
        }
    }

    pub async fn kill(&self, id: &str) -> Result<(), SessionError> {
        let mux_name = {
            let mut state = self.state.lock().await;
            let record = state.sessions.get_mut(id).ok_or(SessionError::SessionNotFound)?;
            record.state = SessionState::Killing;
            record.mux_name.clone()
        };

        let tmux = self.tmux.clone();
        let interrupt_name = mux_name.clone();
        let _ = tokio::task::spawn_blocking(move || tmux.send_named_key(&interrupt_name, "C-c")).await;
        tokio::time::sleep(crate::constants::KILL_GRACE_PERIOD).await;

        let kill_result = tokio::task::spawn_blocking({
            let tmux = self.tmux.clone();
            let mux_name = mux_name.clone();
            move || tmux.kill_session(&mux_name)
        })
        .await;

        let mut state = self.state.lock().await;
        match kill_result {
            Ok(Ok(())) => {
                state.sessions.remove(id);
                if let Err(e) = flush(&self.path, &state.sessions, &state.recent_directories) {
                    log::error!("failed to persist session store: {e}");
                }
                drop(state);
                self.emitter.emit(SessionEvent::Killed { id: id.to_string() }).await;
                Ok(())
            }
            _ => {
                if let Some(record) = state.sessions.get_mut(id) {
                    record.state = SessionState::Active;
                }
                Err(SessionError::KillFailed)
            }
        }
    }

    pub async fn rename(&self, id: &str, display_name: &str) -> Result<(), SessionError> {
        let sanitized = sanitize_display_name(display_name);
        if sanitized.is_empty() {
            return Err(SessionError::InvalidName);
        }

        let mut state = self.state.lock().await;
        if state.sessions.values().any(|r| r.id != id && r.display_name == sanitized) {
            return Err(SessionError::SessionExists);
        }
        let record = state.sessions.get_mut(id).ok_or(SessionError::SessionNotFound)?;
        record.display_name = sanitized.clone();
        if let Err(e) = flush(&self.path, &state.sessions, &state.recent_directories) {
            log::error!("failed to persist session store: {e}");
        }
        drop(state);
        self.emitter.emit(SessionEvent::Renamed { id: id.to_string(), display_name: sanitized }).await;
        Ok(())
    }

    /// `O(1)` lookup by session id, without forcing a mux reconciliation.
    pub async fn get(&self, id: &str) -> Option<SessionRecord> {
        self.state.lock().await.sessions.get(id).cloned()
    }

    pub async fn get_agents(&self) -> Vec<String> {
        self.config.available_agents.clone()
    }

    /// Children of the allowed roots plus the bounded recent-directory list.
    pub async fn get_directories(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut dirs: Vec<String> = state.recent_directories.iter().cloned().collect();

        for root in &self.config.directory_allowlist {
            if let Ok(entries) = std::fs::read_dir(root) {
                for entry in entries.flatten() {
                    if entry.path().is_dir() {
                        if let Some(s) = entry.path().to_str() {
                            if !dirs.contains(&s.to_string()) {
                                dirs.push(s.to_string());
                            }
                        }
                    }
                }
            }
        }
        dirs
    }

    fn validate_directory(&self, directory: &str) -> Result<(), SessionError> {
        let path = Path::new(directory);
        if !path.is_dir() {
            return Err(SessionError::DirNotFound);
        }
        if !self.config.directory_allowlist.is_empty()
            && !self.config.directory_allowlist.iter().any(|root| path.starts_with(root))
        {
            return Err(SessionError::DirNotAllowed);
        }
        if self.config.directory_denylist.iter().any(|root| path.starts_with(root)) {
            return Err(SessionError::DirNotAllowed);
        }
        Ok(())
    }

    fn check_rate_limit(&self, state: &mut State, device_id: &str) -> Result<(), SessionError> {
        let now = now_unix();
        let window_secs = self.config.session_create_rate_window_secs;
        let limit = self.config.session_create_rate_limit;
        let entry = state.rate_limits.entry(device_id.to_string()).or_insert(RateWindow { window_start: now, count: 0 });
        if now.saturating_sub(entry.window_start) >= window_secs {
            entry.window_start = now;
            entry.count = 0;
        }
        if entry.count >= limit {
            return Err(SessionError::RateLimited);
        }
        entry.count += 1;
        Ok(())
    }
}

fn load_stored(path: &Path) -> Result<StoredSessions> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create session store directory")?;
    }
    if !path.exists() {
        return Ok(StoredSessions::default());
    }
    let content = std::fs::read_to_string(path).context("failed to read session store")?;
    serde_json::from_str(&content).context("failed to parse session store")
}

fn flush(path: &Path, sessions: &HashMap<String, SessionRecord>, recent_directories: &RecentDirectories) -> Result<()> {
    let stored = StoredSessions { sessions: sessions.clone(), recent_directories: recent_directories.clone() };
    let content = serde_json::to_string_pretty(&stored).context("failed to serialize session store")?;

    let mut tmp = path.to_path_buf();
    let file_name = tmp.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    tmp.set_file_name(format!(".{file_name}.tmp"));
    {
        let mut file = std::fs::File::create(&tmp).context("failed to create temp session store")?;
        use std::io::Write;
        file.write_all(content.as_bytes())?;
        file.sync_all().context("failed to fsync session store")?;
    }
    #[cfg(unix)]
    std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
        .context("failed to set session store permissions")?;
    std::fs::rename(&tmp, path).context("failed to install session store")?;
    Ok(())
}

fn generate_session_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let raw = crate::crypto::random_bytes(crate::constants::SESSION_ID_LEN);
    raw.iter().map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char).collect()
}

fn slugify(directory: &str) -> String {
    let base = Path::new(directory).file_name().and_then(|n| n.to_str()).unwrap_or("session");
    let slug: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug
    }
}

fn sanitize_display_name(name: &str) -> String {
    name.trim().chars().filter(|c| !c.is_control()).take(64).collect()
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEmitter {
        events: std::sync::Mutex<Vec<SessionEvent>>,
    }

    #[async_trait]
    impl SessionEventEmitter for NullEmitter {
        async fn emit(&self, event: SessionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn temp_store_path() -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::mem::forget(dir);
        path
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.multiplexer_binary = "tmux".to_string();
        config.directory_allowlist = vec![dir.to_path_buf()];
        config.available_agents = vec!["bash".to_string()];
        config.max_sessions = 2;
        config.session_create_rate_limit = 1;
        config.session_create_rate_window_secs = 60;
        config
    }

    #[test]
    fn generated_ids_are_alphanumeric_and_right_length() {
        let id = generate_session_id();
        assert_eq!(id.len(), crate::constants::SESSION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn slugify_lowercases_and_replaces_non_alphanumerics() {
        assert_eq!(slugify("/home/user/My Project"), "my-project");
        assert_eq!(slugify(""), "session");
    }

    #[tokio::test]
    async fn create_rejects_unknown_agent() {
        let allowed_dir = tempfile::tempdir().unwrap();
        let config = test_config(allowed_dir.path());
        let emitter = Arc::new(NullEmitter { events: std::sync::Mutex::new(Vec::new()) });
        let manager = SessionManager::new(temp_store_path(), config, emitter).unwrap();

        let result = manager
            .create("dev-1", "not-an-agent", allowed_dir.path().to_str().unwrap(), "My Session")
            .await;
        assert_eq!(result.unwrap_err(), SessionError::AgentNotFound);
    }

    #[tokio::test]
    async fn create_rejects_directory_outside_allowlist() {
        let allowed_dir = tempfile::tempdir().unwrap();
        let other_dir = tempfile::tempdir().unwrap();
        let config = test_config(allowed_dir.path());
        let emitter = Arc::new(NullEmitter { events: std::sync::Mutex::new(Vec::new()) });
        let manager = SessionManager::new(temp_store_path(), config, emitter).unwrap();

        let result = manager.create("dev-1", "bash", other_dir.path().to_str().unwrap(), "My Session").await;
        assert_eq!(result.unwrap_err(), SessionError::DirNotAllowed);
    }

    #[tokio::test]
    async fn rename_rejects_blank_name() {
        let allowed_dir = tempfile::tempdir().unwrap();
        let config = test_config(allowed_dir.path());
        let emitter = Arc::new(NullEmitter { events: std::sync::Mutex::new(Vec::new()) });
        let manager = SessionManager::new(temp_store_path(), config, emitter).unwrap();

        let result = manager.rename("nonexistent", "   ").await;
        assert_eq!(result.unwrap_err(), SessionError::InvalidName);
    }

    #[tokio::test]
    async fn kill_of_unknown_session_is_not_found() {
        let allowed_dir = tempfile::tempdir().unwrap();
        let config = test_config(allowed_dir.path());
        let emitter = Arc::new(NullEmitter { events: std::sync::Mutex::new(Vec::new()) });
        let manager = SessionManager::new(temp_store_path(), config, emitter).unwrap();

        let result = manager.kill("nonexistent").await;
        assert_eq!(result.unwrap_err(), SessionError::SessionNotFound);
    }

    #[test]
    fn recent_directories_dedupes_and_caps() {
        let mut recents = RecentDirectories::default();
        for i in 0..(RECENT_DIRECTORIES_CAP + 5) {
            recents.remember(&format!("/dir/{i}"));
        }
        assert_eq!(recents.0.len(), RECENT_DIRECTORIES_CAP);
        assert_eq!(recents.0.front().unwrap(), &format!("/dir/{}", RECENT_DIRECTORIES_CAP + 4));

        recents.remember("/dir/dup");
        recents.remember("/dir/dup");
        assert_eq!(recents.0.iter().filter(|d| *d == "/dir/dup").count(), 1);
    }
}
