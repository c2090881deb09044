//! Cross-module integration tests for pairing-session bootstrap and
//! device-store persistence across a simulated daemon restart.

use std::sync::Arc;

use ras_daemon::device::{new_paired_device, DeviceStore};
use ras_daemon::pairing::session::PairingState;
use ras_daemon::pairing::PairingCoordinator;

fn temp_devices_path() -> std::path::PathBuf {
    let dir = tempfile::tempdir().expect("create temp dir").keep();
    dir.join("devices.json")
}

fn test_coordinator(devices: Arc<tokio::sync::Mutex<DeviceStore>>) -> Arc<PairingCoordinator> {
    let connections = ras_daemon::connection_manager::ConnectionManager::new();
    let message_sink: ras_daemon::pairing::MessageSink = Arc::new(|_device_id, _bytes| {});
    let on_complete: ras_daemon::pairing::OnPairingComplete = Arc::new(|_device_id, _device_name| {});
    Arc::new(PairingCoordinator::new(
        devices,
        connections,
        "https://ntfy.sh".to_string(),
        "daemon-under-test".to_string(),
        on_complete,
        message_sink,
    ))
}

#[tokio::test]
async fn start_pairing_creates_a_pending_session_with_a_qr() {
    let devices = Arc::new(tokio::sync::Mutex::new(DeviceStore::load(temp_devices_path()).unwrap()));
    let coordinator = test_coordinator(devices);

    let (session_id, qr) = coordinator.start_pairing().await.unwrap();

    assert_eq!(session_id.len(), 24, "session id is the 24-char hex rendering");
    assert!(session_id.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(!qr.is_empty());
    assert_eq!(coordinator.session_state(&session_id).await, Some(PairingState::Pending));
}

#[tokio::test]
async fn unknown_session_has_no_state() {
    let devices = Arc::new(tokio::sync::Mutex::new(DeviceStore::load(temp_devices_path()).unwrap()));
    let coordinator = test_coordinator(devices);

    assert_eq!(coordinator.session_state("does-not-exist").await, None);
}

#[tokio::test]
async fn paired_device_survives_a_store_reload() {
    let path = temp_devices_path();

    {
        let mut store = DeviceStore::load(path.clone()).unwrap();
        let device = new_paired_device("device-1".to_string(), "Pixel 7".to_string(), [9u8; 32]);
        store.upsert(device).unwrap();
        assert!(store.contains("device-1"));
    }

    // Simulate a daemon restart: reload the store from disk.
    let reloaded = DeviceStore::load(path).unwrap();
    assert!(reloaded.contains("device-1"));
    assert_eq!(reloaded.get("device-1").unwrap().display_name, "Pixel 7");
    assert_eq!(reloaded.len(), 1);
}

#[tokio::test]
async fn removing_a_device_persists_across_reload() {
    let path = temp_devices_path();

    {
        let mut store = DeviceStore::load(path.clone()).unwrap();
        store.upsert(new_paired_device("device-2".to_string(), "iPad".to_string(), [3u8; 32])).unwrap();
    }

    {
        let mut store = DeviceStore::load(path.clone()).unwrap();
        assert!(store.remove("device-2").unwrap());
    }

    let reloaded = DeviceStore::load(path).unwrap();
    assert!(!reloaded.contains("device-2"));
    assert!(reloaded.is_empty());
}
