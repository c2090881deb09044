//! Per-message validation: type, session binding, timestamp freshness,
//! nonce replay cache, SDP sanity, device-name sanitization.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::{MAX_DEVICE_NAME_LEN, MAX_SDP_BYTES, NONCE_CACHE_CAPACITY, SIGNALING_FRESHNESS_WINDOW};
use crate::signaling::envelope::SignalEnvelope;

/// Bounded FIFO set of recently seen nonces. Atomic check-and-add under one
/// lock, per the concurrency model's requirement that the cache be
/// thread-safe as a unit.
#[derive(Debug)]
pub struct NonceCache {
    inner: Mutex<NonceCacheInner>,
}

#[derive(Debug)]
struct NonceCacheInner {
    order: VecDeque<Vec<u8>>,
    seen: HashSet<Vec<u8>>,
    capacity: usize,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::with_capacity(NONCE_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(NonceCacheInner {
                order: VecDeque::with_capacity(capacity),
                seen: HashSet::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Returns `true` if `nonce` was newly inserted (not a replay). Atomic:
    /// the test and the insert happen under the same lock acquisition.
    pub fn check_and_add(&self, nonce: &[u8]) -> bool {
        let mut inner = self.inner.lock().expect("nonce cache mutex poisoned");
        if inner.seen.contains(nonce) {
            return false;
        }
        if inner.order.len() >= inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        inner.order.push_back(nonce.to_vec());
        inner.seen.insert(nonce.to_vec());
        true
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("nonce cache mutex poisoned");
        inner.order.clear();
        inner.seen.clear();
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Reason a signaling message was rejected. Never serialized to the wire —
/// callers at the signaling boundary drop silently and log at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    WrongType,
    SessionMismatch,
    SessionIdInvalid,
    StaleTimestamp,
    NonceLengthInvalid,
    NonceReplayed,
    SdpEmpty,
    SdpBadPreamble,
    SdpMissingMediaLine,
    SdpTooLarge,
    DeviceIdMissing,
    DeviceNameTooLong,
}

pub const MAX_SESSION_ID_LEN: usize = 64;
const NONCE_LEN: usize = 16;

/// What the validator expects to see, set at construction per the
/// pairing-vs-reconnection mode of the owning handler.
pub struct ExpectedContext<'a> {
    pub session_id: Option<&'a str>,
    pub expected_type: &'static str,
}

pub fn validate(envelope: &SignalEnvelope, expected: &ExpectedContext<'_>, nonce_cache: &NonceCache) -> Result<(), ValidationError> {
    if envelope.type_name() != expected.expected_type {
        return Err(ValidationError::WrongType);
    }

    let session_id = envelope.session_id();
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN || !session_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::SessionIdInvalid);
    }
    if let Some(expected_session) = expected.session_id {
        if session_id != expected_session {
            return Err(ValidationError::SessionMismatch);
        }
    }

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let ts = envelope.timestamp();
    let skew = now.abs_diff(ts);
    if skew > SIGNALING_FRESHNESS_WINDOW.as_secs() {
        return Err(ValidationError::StaleTimestamp);
    }

    let nonce = envelope.nonce();
    if nonce.len() != NONCE_LEN {
        return Err(ValidationError::NonceLengthInvalid);
    }
    if !nonce_cache.check_and_add(nonce) {
        return Err(ValidationError::NonceReplayed);
    }

    if let SignalEnvelope::Offer(offer) = envelope {
        validate_sdp(&offer.sdp)?;
        if offer.device_id.is_empty() {
            return Err(ValidationError::DeviceIdMissing);
        }
        if offer.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ValidationError::DeviceNameTooLong);
        }
    }

    Ok(())
}

fn validate_sdp(sdp: &str) -> Result<(), ValidationError> {
    if sdp.is_empty() {
        return Err(ValidationError::SdpEmpty);
    }
    if sdp.len() > MAX_SDP_BYTES {
        return Err(ValidationError::SdpTooLarge);
    }
    if !sdp.starts_with("v=0") {
        return Err(ValidationError::SdpBadPreamble);
    }
    if !sdp.lines().any(|line| line.starts_with("m=")) {
        return Err(ValidationError::SdpMissingMediaLine);
    }
    Ok(())
}

/// Replace control bytes with spaces, collapse whitespace runs, trim, and
/// truncate to [`MAX_DEVICE_NAME_LEN`] chars. Invalid UTF-8 becomes
/// replacement characters upstream (the caller passes a `&str` already
/// produced via `String::from_utf8_lossy`).
pub fn sanitize_device_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if (c as u32) < 0x20 || c as u32 == 0x7F { ' ' } else { c })
        .collect();

    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim().chars().take(MAX_DEVICE_NAME_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_cache_rejects_replay() {
        let cache = NonceCache::new();
        assert!(cache.check_and_add(&[1; 16]));
        assert!(!cache.check_and_add(&[1; 16]));
        assert!(cache.check_and_add(&[2; 16]));
    }

    #[test]
    fn nonce_cache_evicts_oldest_at_capacity() {
        let cache = NonceCache::with_capacity(2);
        assert!(cache.check_and_add(&[1; 16]));
        assert!(cache.check_and_add(&[2; 16]));
        assert!(cache.check_and_add(&[3; 16]));
        // [1;16] was evicted, so it is accepted again.
        assert!(cache.check_and_add(&[1; 16]));
    }

    #[test]
    fn sanitize_collapses_whitespace_and_strips_control_bytes() {
        assert_eq!(sanitize_device_name("  Pixel\t7\x07  Pro  "), "Pixel 7 Pro");
        assert_eq!(sanitize_device_name(""), "");
    }

    #[test]
    fn sanitize_truncates_to_max_len() {
        let long = "x".repeat(100);
        assert_eq!(sanitize_device_name(&long).len(), MAX_DEVICE_NAME_LEN);
    }

    #[test]
    fn sdp_must_start_with_v0_and_have_media_line() {
        assert_eq!(validate_sdp(""), Err(ValidationError::SdpEmpty));
        assert_eq!(validate_sdp("x=bad"), Err(ValidationError::SdpBadPreamble));
        assert_eq!(validate_sdp("v=0\r\no=x\r\n"), Err(ValidationError::SdpMissingMediaLine));
        assert!(validate_sdp("v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n").is_ok());
    }
}
