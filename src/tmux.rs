//! Thin wrapper over the `tmux` CLI: the multiplexer this daemon supervises.
//!
//! Every call shells out and parses plain-text output, the same way
//! `tailscale.rs` wraps the Tailscale CLI. Blocking `Command::output()` calls
//! run inside `spawn_blocking` so the async session manager never stalls on
//! a slow subprocess.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;

use crate::constants::MIN_MULTIPLEXER_VERSION;

/// One session as tmux reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxSession {
    pub name: String,
    pub attached: bool,
}

/// Thin synchronous wrapper; callers run it on a blocking thread.
#[derive(Debug, Clone)]
pub struct Tmux {
    binary: String,
}

impl Tmux {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Verify the installed tmux is at least [`MIN_MULTIPLEXER_VERSION`].
    pub fn verify_version(&self) -> Result<()> {
        let output = Command::new(&self.binary).arg("-V").output().context("failed to execute tmux -V")?;
        if !output.status.success() {
            bail!("tmux -V exited with {}", output.status);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let version = text.trim().rsplit(' ').next().unwrap_or("0.0").trim_start_matches("tmux ");
        let found = semver::Version::parse(&normalize_version(version))
            .with_context(|| format!("unparseable tmux version string: {text}"))?;
        let minimum = semver::Version::parse(MIN_MULTIPLEXER_VERSION).expect("valid minimum version constant");
        if found < minimum {
            bail!("tmux {found} is older than the minimum supported version {minimum}");
        }
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<MuxSession>> {
        let output = Command::new(&self.binary)
            .args(["list-sessions", "-F", "#{session_name}\t#{session_attached}"])
            .output()
            .context("failed to execute tmux list-sessions")?;

        if !output.status.success() {
            // tmux exits non-zero with "no server running" when there are no
            // sessions at all; treat that as an empty list, not an error.
            return Ok(Vec::new());
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .filter_map(|line| {
                let (name, attached) = line.split_once('\t')?;
                Some(MuxSession { name: name.to_string(), attached: attached.trim() != "0" })
            })
            .collect())
    }

    /// Create a detached session named `mux_name`, `cd`'d into `dir`, running
    /// `command`.
    pub fn new_session(&self, mux_name: &str, dir: &Path, command: &str) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["new-session", "-d", "-s", mux_name, "-c"])
            .arg(dir)
            .arg(command)
            .output()
            .context("failed to execute tmux new-session")?;
        if !output.status.success() {
            bail!("tmux new-session failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    pub fn kill_session(&self, mux_name: &str) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["kill-session", "-t", mux_name])
            .output()
            .context("failed to execute tmux kill-session")?;
        if !output.status.success() {
            bail!("tmux kill-session failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    /// Send literal bytes as keystrokes. `-l` disables tmux's own key-name
    /// interpretation so arbitrary escape sequences pass through untouched.
    pub fn send_keys(&self, mux_name: &str, bytes: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let output = Command::new(&self.binary)
            .args(["send-keys", "-t", mux_name, "-l", "--"])
            .arg(text)
            .output()
            .context("failed to execute tmux send-keys")?;
        if !output.status.success() {
            bail!("tmux send-keys failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    /// Send a named key (e.g. `C-c`) without the `-l` literal flag.
    pub fn send_named_key(&self, mux_name: &str, key: &str) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["send-keys", "-t", mux_name, key])
            .output()
            .context("failed to execute tmux send-keys")?;
        if !output.status.success() {
            bail!("tmux send-keys failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    pub fn capture_pane(&self, mux_name: &str) -> Result<Vec<u8>> {
        let output = Command::new(&self.binary)
            .args(["capture-pane", "-t", mux_name, "-p", "-e"])
            .output()
            .context("failed to execute tmux capture-pane")?;
        if !output.status.success() {
            bail!("tmux capture-pane failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(output.stdout)
    }

    /// Start (or stop) piping a pane's live output to `target_path`.
    pub fn pipe_pane(&self, mux_name: &str, target_path: Option<&Path>) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["pipe-pane", "-t", mux_name]);
        if let Some(path) = target_path {
            cmd.arg(format!("cat >> {}", shell_quote(path)));
        }
        let output = cmd.output().context("failed to execute tmux pipe-pane")?;
        if !output.status.success() {
            bail!("tmux pipe-pane failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    pub fn resize_window(&self, mux_name: &str, cols: u16, rows: u16) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["resize-window", "-t", mux_name, "-x", &cols.to_string(), "-y", &rows.to_string()])
            .output()
            .context("failed to execute tmux resize-window")?;
        if !output.status.success() {
            bail!("tmux resize-window failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }
}

fn normalize_version(raw: &str) -> String {
    let digits_and_dots: String = raw.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
    match digits_and_dots.matches('.').count() {
        0 => format!("{digits_and_dots}.0.0"),
        1 => format!("{digits_and_dots}.0"),
        _ => digits_and_dots,
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_major_and_major_minor_versions() {
        assert_eq!(normalize_version("3"), "3.0.0");
        assert_eq!(normalize_version("3.3a"), "3.3.0");
        assert_eq!(normalize_version("3.3.1"), "3.3.1");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote(Path::new("/tmp/it's")), "'/tmp/it'\\''s'");
    }

    #[test]
    fn parses_session_list_output() {
        let text = "ras-bash-a1b2\t1\nras-bash-c3d4\t0\n";
        let sessions: Vec<MuxSession> = text
            .lines()
            .filter_map(|line| {
                let (name, attached) = line.split_once('\t')?;
                Some(MuxSession { name: name.to_string(), attached: attached.trim() != "0" })
            })
            .collect();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].attached);
        assert!(!sessions[1].attached);
    }
}
