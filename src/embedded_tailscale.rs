//! Embedded Tailscale binary management.
//!
//! The Tailscale binary is embedded at compile time (`include_bytes!`) and
//! extracted on first use to `~/.rasd/bin/tailscale`, so the daemon has no
//! runtime dependency beyond itself.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Version of the embedded Tailscale binary. Must match the version
/// downloaded in `build.rs`.
pub const EMBEDDED_TAILSCALE_VERSION: &str = "1.76.6";

/// The embedded Tailscale binary, included at compile time.
const TAILSCALE_BINARY: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/tailscale"));

/// Marker file tracking which version is currently extracted.
const VERSION_MARKER: &str = ".tailscale_version";

/// Get the path to the Tailscale binary, extracting it if necessary.
pub fn get_tailscale_binary_path() -> Result<PathBuf> {
    let bin_dir = get_bin_directory()?;
    let binary_path = bin_dir.join("tailscale");
    let version_path = bin_dir.join(VERSION_MARKER);

    let needs_extraction = if binary_path.exists() && version_path.exists() {
        let existing_version = fs::read_to_string(&version_path).unwrap_or_default();
        existing_version.trim() != EMBEDDED_TAILSCALE_VERSION
    } else {
        true
    };

    if needs_extraction {
        extract_tailscale_binary(&binary_path, &version_path)?;
    }

    Ok(binary_path)
}

fn get_bin_directory() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    let bin_dir = home.join(".rasd").join("bin");
    fs::create_dir_all(&bin_dir).context("failed to create bin directory")?;
    Ok(bin_dir)
}

fn extract_tailscale_binary(binary_path: &PathBuf, version_path: &PathBuf) -> Result<()> {
    log::info!(
        "Extracting embedded Tailscale {} to {}",
        EMBEDDED_TAILSCALE_VERSION,
        binary_path.display()
    );

    let mut file = File::create(binary_path).context("failed to create Tailscale binary file")?;
    file.write_all(TAILSCALE_BINARY).context("failed to write Tailscale binary")?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(binary_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(binary_path, perms).context("failed to set executable permissions")?;
    }

    fs::write(version_path, EMBEDDED_TAILSCALE_VERSION).context("failed to write version marker")?;

    log::info!("Tailscale binary extracted successfully");
    Ok(())
}

/// Sanity check: a real Tailscale binary is ~30-40MB, the placeholder
/// written by `build.rs` when offline is under 1KB.
pub fn is_binary_valid() -> bool {
    TAILSCALE_BINARY.len() > 1_000_000
}

pub fn get_binary_info() -> BinaryInfo {
    BinaryInfo {
        version: EMBEDDED_TAILSCALE_VERSION.to_string(),
        size_bytes: TAILSCALE_BINARY.len(),
        is_valid: is_binary_valid(),
    }
}

/// Information about the embedded Tailscale binary.
#[derive(Debug)]
pub struct BinaryInfo {
    pub version: String,
    pub size_bytes: usize,
    pub is_valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_info() {
        let info = get_binary_info();
        assert_eq!(info.version, EMBEDDED_TAILSCALE_VERSION);
        assert!(info.size_bytes > 0);
    }

    #[test]
    fn test_get_bin_directory() {
        let dir = get_bin_directory();
        assert!(dir.is_ok());
        assert!(dir.unwrap().ends_with(".rasd/bin"));
    }
}
