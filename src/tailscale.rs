//! Tailscale integration for VPN-direct overlay connectivity.
//!
//! Wraps the Tailscale CLI so the daemon can join an operator-managed
//! tailnet and advertise its overlay address as an additional ICE candidate,
//! giving paired devices a direct path when they're also on the tailnet.
//!
//! # Embedded Binary
//!
//! The Tailscale binary is embedded at compile time (`build.rs`) and
//! extracted to `~/.rasd/bin/tailscale` on first use, so the daemon has no
//! external runtime dependency.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tokio::time::sleep;

use crate::embedded_tailscale;

/// Get the path to the embedded Tailscale binary, extracting it on first use.
fn get_tailscale_binary() -> Result<PathBuf> {
    if !embedded_tailscale::is_binary_valid() {
        bail!(
            "Tailscale binary not available. The build may have failed to download Tailscale. \
             Please rebuild with internet access or set TAILSCALE_BINARY_PATH to a valid binary."
        );
    }

    embedded_tailscale::get_tailscale_binary_path()
}

/// Default Headscale/Tailscale control server URL for local development.
const DEFAULT_CONTROL_URL: &str = "http://localhost:8080";

/// Client for the overlay mesh the daemon joins for VPN-direct reconnection.
#[derive(Debug)]
pub struct TailscaleClient {
    control_url: String,
    instance_id: String,
    connected: bool,
}

impl TailscaleClient {
    /// Create a new client. `instance_id` seeds the tailnet hostname
    /// (`rasd-<instance_id>`).
    pub fn new(instance_id: &str, control_url: Option<&str>) -> Self {
        Self {
            control_url: control_url.unwrap_or(DEFAULT_CONTROL_URL).to_string(),
            instance_id: instance_id.to_string(),
            connected: false,
        }
    }

    /// Join the tailnet using a pre-auth key.
    pub async fn up(&mut self, preauth_key: &str) -> Result<()> {
        let hostname = format!("rasd-{}", &self.instance_id);

        log::info!("Connecting to tailnet via {} as {}", self.control_url, hostname);

        let tailscale_bin = get_tailscale_binary()?;
        let output = Command::new(&tailscale_bin)
            .args([
                "up",
                "--login-server",
                &self.control_url,
                "--authkey",
                preauth_key,
                "--ssh",
                "--hostname",
                &hostname,
                "--accept-routes",
                "--reset",
            ])
            .output()
            .context("failed to execute tailscale up")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tailscale up failed: {}", stderr);
        }

        self.wait_for_connection().await?;
        self.connected = true;

        log::info!("Connected to tailnet at {}", self.ip().unwrap_or_default());
        Ok(())
    }

    /// Leave the tailnet.
    pub fn down(&mut self) -> Result<()> {
        log::info!("Disconnecting from tailnet");

        let tailscale_bin = get_tailscale_binary()?;
        let output = Command::new(&tailscale_bin)
            .args(["down"])
            .output()
            .context("failed to execute tailscale down")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::warn!("tailscale down failed: {}", stderr);
        }

        self.connected = false;
        Ok(())
    }

    /// Get the tailnet IPv4 address, used as an extra ICE candidate when
    /// post-processing an answer SDP.
    pub fn ip(&self) -> Result<String> {
        let tailscale_bin = get_tailscale_binary()?;
        let output = Command::new(&tailscale_bin)
            .args(["ip", "-4"])
            .output()
            .context("failed to execute tailscale ip")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tailscale ip failed: {}", stderr);
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether the daemon currently reports a connected tailnet session.
    pub fn is_connected(&self) -> bool {
        if !self.connected {
            return false;
        }
        self.check_connection_status().unwrap_or(false)
    }

    async fn wait_for_connection(&self) -> Result<()> {
        let max_attempts = 30;
        let poll_interval = Duration::from_millis(500);

        for attempt in 1..=max_attempts {
            if self.check_connection_status()? {
                return Ok(());
            }
            log::debug!("Waiting for tailnet connection... (attempt {}/{})", attempt, max_attempts);
            sleep(poll_interval).await;
        }

        bail!("timed out waiting for tailnet connection")
    }

    fn check_connection_status(&self) -> Result<bool> {
        let tailscale_bin = get_tailscale_binary()?;
        let output = Command::new(&tailscale_bin)
            .args(["status", "--json"])
            .output()
            .context("failed to execute tailscale status")?;

        if !output.status.success() {
            return Ok(false);
        }

        let status: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("failed to parse tailscale status")?;

        let backend_state = status.get("BackendState").and_then(|v| v.as_str()).unwrap_or("");
        Ok(backend_state == "Running")
    }
}

// No Drop impl: disconnecting the overlay should not be tied to this value's
// scope, and tokio runtimes panic on async work performed from Drop. Call
// down() explicitly during orchestrator shutdown.

/// Post-process an answer SDP, appending a host candidate for the daemon's
/// tailnet address so a peer on the same overlay can select a direct path.
/// Best-effort: returns the SDP unchanged if the overlay address is unavailable.
pub fn inject_vpn_candidate(sdp: &str, client: &TailscaleClient) -> String {
    let Ok(addr) = client.ip() else {
        return sdp.to_string();
    };
    if addr.is_empty() {
        return sdp.to_string();
    }

    let candidate_line = format!(
        "a=candidate:rasd-vpn 1 udp 2130706431 {addr} 0 typ host\r\n"
    );

    match sdp.find("\r\nm=") {
        Some(pos) => {
            let (head, tail) = sdp.split_at(pos + 2);
            format!("{head}{candidate_line}{tail}")
        }
        None => format!("{sdp}{candidate_line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_with_default_url() {
        let client = TailscaleClient::new("instance123", None);
        assert_eq!(client.control_url, DEFAULT_CONTROL_URL);
        assert_eq!(client.instance_id, "instance123");
        assert!(!client.connected);
    }

    #[test]
    fn test_new_with_custom_url() {
        let client = TailscaleClient::new("instance456", Some("https://headscale.example.com"));
        assert_eq!(client.control_url, "https://headscale.example.com");
    }
}
