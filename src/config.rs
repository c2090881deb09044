//! Daemon configuration: loading, defaults, and persistence.
//!
//! The config file is TOML, loaded from the OS config directory with the
//! same override chain the rest of the ambient stack uses: `cfg(test)` →
//! `RAS_CONFIG_DIR` env var → `RAS_ENV=test`/`system_test` → platform default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the multiplexer binary (e.g. `tmux`).
    pub multiplexer_binary: String,
    /// Directories under which sessions may be created. Empty means "any
    /// directory not explicitly denied".
    pub directory_allowlist: Vec<PathBuf>,
    /// Directories (and their descendants) that are never allowed.
    pub directory_denylist: Vec<PathBuf>,
    /// Agent binaries that may be launched in a new session.
    pub available_agents: Vec<String>,
    /// Maximum concurrent multiplexer sessions.
    pub max_sessions: usize,
    /// Per-device session-create rate limit (count per window).
    pub session_create_rate_limit: u32,
    /// Session-create rate-limit window, in seconds.
    pub session_create_rate_window_secs: u64,

    /// Base URL of the ntfy-style relay server.
    pub relay_server_url: String,
    /// Bind address for the direct HTTP signaling endpoint.
    pub http_signaling_bind: SocketAddr,
    /// Bind address for the LAN-direct WebSocket listener.
    pub lan_ws_bind: SocketAddr,
    /// Bind address for the VPN-direct framed UDP listener.
    pub vpn_udp_bind: SocketAddr,

    /// Maximum accepted clipboard image size, in bytes.
    pub max_image_size: u64,
    /// Text-paste approval threshold, in bytes.
    pub text_paste_approval_threshold: usize,

    /// Per-session notification cooldown, in seconds.
    pub notification_cooldown_secs: u64,
    /// Regex patterns that mark an approval-style notification.
    pub notification_approval_patterns: Vec<String>,
    /// Regex patterns that mark an error-style notification.
    pub notification_error_patterns: Vec<String>,
    /// Regex patterns that mark a shell prompt (used to detect completion).
    pub notification_prompt_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multiplexer_binary: "tmux".to_string(),
            directory_allowlist: Vec::new(),
            directory_denylist: Vec::new(),
            available_agents: vec!["bash".to_string()],
            max_sessions: crate::constants::DEFAULT_MAX_SESSIONS,
            session_create_rate_limit: crate::constants::SESSION_CREATE_RATE_LIMIT,
            session_create_rate_window_secs: crate::constants::SESSION_CREATE_RATE_WINDOW.as_secs(),

            relay_server_url: "https://ntfy.sh".to_string(),
            http_signaling_bind: "127.0.0.1:7890".parse().expect("valid default socket addr"),
            lan_ws_bind: "0.0.0.0:7891".parse().expect("valid default socket addr"),
            vpn_udp_bind: "0.0.0.0:7892".parse().expect("valid default socket addr"),

            max_image_size: 20 * 1024 * 1024,
            text_paste_approval_threshold: crate::constants::TEXT_PASTE_APPROVAL_THRESHOLD,

            notification_cooldown_secs: crate::constants::NOTIFICATION_COOLDOWN.as_secs(),
            notification_approval_patterns: vec![r"(?i)\b(y/n|yes/no|proceed\?)\s*$".to_string()],
            notification_error_patterns: vec![r"(?i)\b(error|failed|exception)\b".to_string()],
            notification_prompt_patterns: vec![r"[$%#>]\s*$".to_string()],
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/rasd-test`
    /// 2. `RAS_CONFIG_DIR` env var: explicit override
    /// 3. `RAS_ENV=test`/`system_test`: `tmp/rasd-test`
    /// 4. Default: platform config dir (e.g. `~/.config/rasd`)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/rasd-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("RAS_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::is_any_test() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/rasd-test")
                } else {
                    dirs::config_dir()
                        .context("could not determine config directory")?
                        .join(crate::env::APP_NAME)
                }
            }
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration from `{config_dir}/config.toml`, falling back to
    /// defaults if the file is absent or unreadable.
    pub fn load() -> Result<Self> {
        match Self::load_from_file() {
            Ok(config) => Ok(config),
            Err(_) => Ok(Self::default()),
        }
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_dir()?.join("config.toml");
        let content = std::fs::read_to_string(&path).context("config file not found")?;
        toml::from_str(&content).context("failed to parse config.toml")
    }

    /// Persist the current configuration to `{config_dir}/config.toml`.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_dir()?.join("config.toml");
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, content).context("failed to write config.toml")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.multiplexer_binary, "tmux");
        assert_eq!(config.max_sessions, 20);
        assert!(!config.available_agents.is_empty());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.relay_server_url, config.relay_server_url);
        assert_eq!(parsed.max_sessions, config.max_sessions);
    }
}
