//! Device store: the persistent mapping from `device_id` to paired-device record.
//!
//! Three obligations: atomic write (write-to-temp, fsync, rename), owner-only
//! file permissions, and synchronous load at startup. The store does not
//! authenticate anything itself; it only records the shared secret that
//! downstream components (signaling, reconnection transports) use to
//! authenticate a device.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::MasterSecret;

/// A single paired device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub device_id: String,
    pub display_name: String,
    #[serde(with = "hex_secret")]
    pub master_secret: MasterSecret,
    pub paired_at: u64,
    pub last_seen: u64,
}

mod hex_secret {
    use super::MasterSecret;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &MasterSecret, ser: S) -> Result<S::Ok, S::Error> {
        let hex: String = secret.iter().map(|b| format!("{b:02x}")).collect();
        ser.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<MasterSecret, D::Error> {
        let hex = String::deserialize(de)?;
        if hex.len() != 64 {
            return Err(serde::de::Error::custom("master_secret hex must be 64 chars"));
        }
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| serde::de::Error::custom("invalid hex in master_secret"))?;
        }
        Ok(out)
    }
}

/// On-disk container: the file holds one JSON object keyed by device id.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredDevices {
    devices: HashMap<String, PairedDevice>,
}

/// Persistent mapping from `device_id` to [`PairedDevice`].
#[derive(Debug)]
pub struct DeviceStore {
    path: PathBuf,
    devices: HashMap<String, PairedDevice>,
}

impl DeviceStore {
    /// Load the store from `path`, creating an empty one if the file doesn't
    /// exist yet. The parent directory is created with `0700` permissions.
    pub fn load(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create device store directory")?;
            #[cfg(unix)]
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                .context("failed to set device directory permissions")?;
        }

        let devices = if path.exists() {
            let content = std::fs::read_to_string(&path).context("failed to read device store")?;
            let stored: StoredDevices =
                serde_json::from_str(&content).context("failed to parse device store")?;
            stored.devices
        } else {
            HashMap::new()
        };

        Ok(Self { path, devices })
    }

    /// The default store path under the OS config directory.
    pub fn default_path() -> Result<PathBuf> {
        Ok(crate::config::Config::config_dir()?.join("devices.json"))
    }

    /// `O(1)` lookup by device id.
    pub fn get(&self, device_id: &str) -> Option<&PairedDevice> {
        self.devices.get(device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PairedDevice> {
        self.devices.values()
    }

    /// Insert or replace a paired device and persist immediately.
    pub fn upsert(&mut self, device: PairedDevice) -> Result<()> {
        self.devices.insert(device.device_id.clone(), device);
        self.flush()
    }

    /// Update `last_seen` for a known device and persist.
    pub fn touch(&mut self, device_id: &str) -> Result<()> {
        if let Some(device) = self.devices.get_mut(device_id) {
            device.last_seen = now_unix();
            self.flush()?;
        }
        Ok(())
    }

    /// Remove a device (explicit unpair) and persist.
    pub fn remove(&mut self, device_id: &str) -> Result<bool> {
        let removed = self.devices.remove(device_id).is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    /// Write-to-temp, fsync, rename: never leaves a half-written store file
    /// on a crash mid-write.
    fn flush(&self) -> Result<()> {
        let stored = StoredDevices {
            devices: self.devices.clone(),
        };
        let content = serde_json::to_string_pretty(&stored).context("failed to serialize device store")?;

        let tmp_path = tmp_path_for(&self.path);
        {
            let mut file = std::fs::File::create(&tmp_path).context("failed to create temp device store")?;
            use std::io::Write;
            file.write_all(content.as_bytes())?;
            file.sync_all().context("failed to fsync device store")?;
        }
        #[cfg(unix)]
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .context("failed to set device store permissions")?;
        std::fs::rename(&tmp_path, &self.path).context("failed to install device store")?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = tmp.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    tmp.set_file_name(format!(".{file_name}.tmp"));
    tmp
}

pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Build a fresh [`PairedDevice`] record at pairing completion.
pub fn new_paired_device(device_id: String, display_name: String, master_secret: MasterSecret) -> PairedDevice {
    let now = now_unix();
    PairedDevice {
        device_id,
        display_name,
        master_secret,
        paired_at: now,
        last_seen: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store_path() -> PathBuf {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.json");
        std::mem::forget(dir);
        path
    }

    #[test]
    fn load_missing_file_is_empty() {
        let store = DeviceStore::load(temp_store_path()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn upsert_then_reload_round_trips() {
        let path = temp_store_path();
        let device = new_paired_device("dev-1".into(), "Phone".into(), [9u8; 32]);

        let mut store = DeviceStore::load(path.clone()).unwrap();
        store.upsert(device.clone()).unwrap();

        let reloaded = DeviceStore::load(path).unwrap();
        let found = reloaded.get("dev-1").unwrap();
        assert_eq!(found.master_secret, device.master_secret);
        assert_eq!(found.display_name, "Phone");
    }

    #[test]
    fn remove_deletes_entry() {
        let path = temp_store_path();
        let mut store = DeviceStore::load(path).unwrap();
        store.upsert(new_paired_device("dev-2".into(), "Tablet".into(), [1u8; 32])).unwrap();
        assert!(store.contains("dev-2"));

        assert!(store.remove("dev-2").unwrap());
        assert!(!store.contains("dev-2"));
        assert!(!store.remove("dev-2").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn store_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let path = temp_store_path();
        let mut store = DeviceStore::load(path.clone()).unwrap();
        store.upsert(new_paired_device("dev-3".into(), "Laptop".into(), [2u8; 32])).unwrap();

        let perms = std::fs::metadata(&path).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }
}
