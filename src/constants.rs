//! Application-wide constants for the daemon.
//!
//! Centralizes the timeouts and thresholds named throughout the spec so they
//! aren't scattered as magic numbers through the protocol modules.

use std::time::Duration;

// ============================================================================
// Signaling / crypto
// ============================================================================

/// Acceptable clock skew for signaling timestamps: `|now - timestamp| <= 30s`.
pub const SIGNALING_FRESHNESS_WINDOW: Duration = Duration::from_secs(30);

/// Capacity of the FIFO nonce replay cache.
pub const NONCE_CACHE_CAPACITY: usize = 100;

/// Maximum SDP size accepted by the signaling validator.
pub const MAX_SDP_BYTES: usize = 64 * 1024;

/// Maximum length of a sanitized device display name.
pub const MAX_DEVICE_NAME_LEN: usize = 64;

// ============================================================================
// Pairing
// ============================================================================

/// QR / `pending` state timeout.
pub const PAIRING_QR_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Additional time allotted once `signaling` begins.
pub const PAIRING_SIGNALING_TIMEOUT: Duration = Duration::from_secs(30);
/// Additional time allotted once `connecting` begins.
pub const PAIRING_CONNECTING_TIMEOUT: Duration = Duration::from_secs(30);
/// Additional time allotted for the data-channel auth handshake.
pub const PAIRING_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Peer / ICE
// ============================================================================

/// Best-effort bound on ICE gathering before proceeding anyway.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on `wait_connected`: peer-connection + data channel both open.
pub const PEER_CONNECTED_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Relay client
// ============================================================================

/// Warn (but keep running) once this long has passed since the last inbound event.
pub const RELAY_HEALTH_WARN_THRESHOLD: Duration = Duration::from_secs(120);
/// Force a reconnect once this long has passed since the last inbound event.
pub const RELAY_HEALTH_RECONNECT_THRESHOLD: Duration = Duration::from_secs(180);
/// Delay before the relay subscriber's outer loop retries after a forced reconnect.
pub const RELAY_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Per-request timeout for relay publish attempts.
pub const RELAY_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum publish attempts.
pub const RELAY_PUBLISH_MAX_ATTEMPTS: usize = 3;
/// Backoff delays between publish attempts (index 0 used before attempt 2, etc).
pub const RELAY_PUBLISH_BACKOFF: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

// ============================================================================
// Direct HTTP signaling rate limits
// ============================================================================

/// Per-session rate limit for `POST /signal/{session_id}`.
pub const HTTP_SIGNAL_SESSION_RATE_LIMIT: u32 = 10;
/// Per-remote-address rate limit for `POST /signal/{session_id}`.
pub const HTTP_SIGNAL_IP_RATE_LIMIT: u32 = 100;
/// Rate-limit window for both of the above.
pub const HTTP_SIGNAL_RATE_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// Reconnection transports
// ============================================================================

/// Acceptable clock skew for reconnection-transport HMAC timestamps.
pub const RECONNECT_FRESHNESS_WINDOW: Duration = Duration::from_secs(30);
/// WebSocket close code sent on LAN-direct auth failure.
pub const LAN_AUTH_FAILURE_CLOSE_CODE: u16 = 4001;
/// Maximum accepted `device_id` length in a VPN-UDP auth payload.
pub const VPN_UDP_MAX_DEVICE_ID_LEN: usize = 100;

// ============================================================================
// Connection manager
// ============================================================================

/// Keep-alive sweep interval.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Connections idle longer than this are closed by the keep-alive sweep.
pub const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Message dispatcher
// ============================================================================

/// Bound on any single registered handler; a hung handler never stalls the
/// receive path for other connections.
pub const DISPATCH_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Sessions
// ============================================================================

/// Default cap on concurrent multiplexer sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 20;
/// Default per-device session-create rate limit.
pub const SESSION_CREATE_RATE_LIMIT: u32 = 10;
/// Rate-limit window for session creation.
pub const SESSION_CREATE_RATE_WINDOW: Duration = Duration::from_secs(60);
/// Generated session id length (alphanumeric).
pub const SESSION_ID_LEN: usize = 12;
/// Grace period between a graceful interrupt and a force-kill.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_millis(500);
/// Minimum supported multiplexer version.
pub const MIN_MULTIPLEXER_VERSION: &str = "2.1.0";

// ============================================================================
// Terminal / output buffer
// ============================================================================

/// Retention cap for the per-session circular output buffer.
pub const OUTPUT_BUFFER_CAP_BYTES: usize = 100 * 1024;

// ============================================================================
// Notifications
// ============================================================================

/// Default sliding-window size fed to the notification matcher's patterns.
pub const NOTIFICATION_WINDOW_BYTES: usize = 500;
/// Per-regex timeout to bound catastrophic backtracking.
pub const NOTIFICATION_REGEX_TIMEOUT: Duration = Duration::from_millis(100);
/// Default per-session notification cooldown.
pub const NOTIFICATION_COOLDOWN: Duration = Duration::from_secs(5);
/// Length of the rendered match snippet, in characters.
pub const NOTIFICATION_SNIPPET_LEN: usize = 50;

// ============================================================================
// Clipboard
// ============================================================================

/// Default per-transfer inactivity timeout.
pub const IMAGE_TRANSFER_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on the paste-delivery step once assembly completes.
pub const CLIPBOARD_PASTE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default text-paste approval threshold.
pub const TEXT_PASTE_APPROVAL_THRESHOLD: usize = 100 * 1024;
/// Preview length shown in an `ApprovalRequired` event.
pub const TEXT_PASTE_PREVIEW_LEN: usize = 100;
/// Stale temp-file cutoff applied at startup.
pub const STALE_IMAGE_FILE_AGE: Duration = Duration::from_secs(60 * 60);
/// Prefix used for clipboard image temp files.
pub const IMAGE_TEMP_FILE_PREFIX: &str = "ras-image-";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_values_are_reasonable() {
        assert!(SIGNALING_FRESHNESS_WINDOW == Duration::from_secs(30));
        assert!(RELAY_HEALTH_WARN_THRESHOLD < RELAY_HEALTH_RECONNECT_THRESHOLD);
        assert!(PAIRING_QR_TIMEOUT > PAIRING_AUTH_TIMEOUT);
        assert_eq!(RELAY_PUBLISH_BACKOFF.len(), RELAY_PUBLISH_MAX_ATTEMPTS);
    }

    #[test]
    fn session_id_len_matches_spec() {
        assert_eq!(SESSION_ID_LEN, 12);
    }
}
