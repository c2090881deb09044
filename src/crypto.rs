//! Shared cryptographic primitives for pairing, signaling, and reconnection.
//!
//! All key material derives from a single 32-byte master secret via
//! HKDF-SHA256. Signaling envelopes are authenticated with HMAC-SHA256 and
//! encrypted with AES-256-GCM.
//!
//! # Wire Format
//!
//! Encrypted envelopes are `IV(12) ∥ ciphertext ∥ tag(16)`, base64-encoded
//! on the relay path. Minimum decryptable size is 28 bytes.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Nonce/IV size for AES-256-GCM (96 bits).
const IV_SIZE: usize = 12;
/// GCM authentication tag size.
const TAG_SIZE: usize = 16;
/// Minimum size of a decryptable ciphertext (IV + tag, zero-length plaintext).
pub const MIN_ENCRYPTED_SIZE: usize = IV_SIZE + TAG_SIZE;

/// Master secret: 32 uniformly random bytes, the root of all key material.
pub type MasterSecret = [u8; 32];

/// Errors from crypto operations. Callers at security boundaries should treat
/// any of these as "drop silently" rather than surfacing detail to the peer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext too short")]
    TooShort,
    #[error("invalid base64 encoding")]
    InvalidEncoding,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Generate a new random 32-byte master secret.
pub fn generate_master_secret() -> MasterSecret {
    let mut secret = [0u8; 32];
    rand::rng().fill_bytes(&mut secret);
    secret
}

/// Generate `n` random bytes (nonces, challenge material).
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// Derive a 32-byte key from the master secret via HKDF-SHA256 with an
/// empty salt and `purpose` as the `info` parameter.
///
/// Purpose labels are a wire contract: `"auth"`, `"encrypt"`, `"ntfy"`,
/// `"signaling"` must match byte-for-byte between daemon and mobile client.
pub fn derive_key(master_secret: &MasterSecret, purpose: &str) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, master_secret);
    let mut out = [0u8; 32];
    hk.expand(purpose.as_bytes(), &mut out)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    out
}

/// Derive the session identifier from the master secret.
///
/// `HKDF(master_secret, "session")`, truncated to 12 bytes and hex-encoded
/// to a 24-character string. The exact rendering is a wire contract with
/// already-paired mobile clients; the unit tests below are the authority.
pub fn derive_session_id(master_secret: &MasterSecret) -> String {
    let hk = Hkdf::<Sha256>::new(None, master_secret);
    let mut out = [0u8; 12];
    hk.expand(b"session", &mut out)
        .expect("12 bytes is a valid HKDF-SHA256 output length");
    hex_encode(&out)
}

/// Derive the relay pub/sub topic: `"ras-" + first 6 bytes of SHA256(master_secret), hex`.
pub fn derive_relay_topic(master_secret: &MasterSecret) -> String {
    let digest = Sha256::digest(master_secret);
    format!("ras-{}", hex_encode(&digest[..6]))
}

type HmacSha256 = Hmac<Sha256>;

/// Compute `HMAC-SHA256(key, UTF-8(session_id) ∥ be64(timestamp) ∥ body)`.
///
/// This exact concatenation order is a wire contract shared with the mobile
/// client; changing it breaks every already-paired device.
pub fn compute_signaling_hmac(key: &[u8; 32], session_id: &str, timestamp: u64, body: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(session_id.as_bytes());
    mac.update(&timestamp.to_be_bytes());
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// Verify a signaling HMAC in constant time.
pub fn verify_signaling_hmac(key: &[u8; 32], session_id: &str, timestamp: u64, body: &[u8], tag: &[u8]) -> bool {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(session_id.as_bytes());
    mac.update(&timestamp.to_be_bytes());
    mac.update(body);
    mac.verify_slice(tag).is_ok()
}

/// Compute a plain `HMAC-SHA256(key, data)`, used by the reconnection
/// transports' `HMAC(auth_key, device_id ∥ be64(timestamp) ∥ body)` contract.
pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Verify a plain HMAC in constant time.
pub fn verify_hmac_sha256(key: &[u8; 32], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Domain-separation prefixes for the credential-only pair exchange.
/// Request and response proofs must never be interchangeable.
pub mod pair_exchange {
    pub const REQUEST_DOMAIN: &[u8] = b"ras-pair-request\0";
    pub const RESPONSE_DOMAIN: &[u8] = b"ras-pair-response\0";
}

/// `auth_proof = HMAC(auth_key, REQUEST_DOMAIN ∥ session_id ∥ device_id ∥ nonce)`.
pub fn pair_request_proof(auth_key: &[u8; 32], session_id: &str, device_id: &str, nonce: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key).expect("HMAC accepts any key length");
    mac.update(pair_exchange::REQUEST_DOMAIN);
    mac.update(session_id.as_bytes());
    mac.update(device_id.as_bytes());
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
}

/// `auth_proof = HMAC(auth_key, RESPONSE_DOMAIN ∥ nonce)`.
pub fn pair_response_proof(auth_key: &[u8; 32], nonce: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key).expect("HMAC accepts any key length");
    mac.update(pair_exchange::RESPONSE_DOMAIN);
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
}

/// Encrypt `plaintext` with AES-256-GCM, returning `IV ∥ ciphertext ∥ tag`.
/// The IV is fresh random bytes on every call.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("valid key length");
    let mut iv_bytes = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv_bytes);
    let nonce = Nonce::from_slice(&iv_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-256-GCM encryption over a fresh nonce cannot fail");
    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt an `IV ∥ ciphertext ∥ tag` blob produced by [`encrypt`].
pub fn decrypt(key: &[u8; 32], wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wire.len() < MIN_ENCRYPTED_SIZE {
        return Err(CryptoError::TooShort);
    }
    let cipher = Aes256Gcm::new_from_slice(key).expect("valid key length");
    let (iv, ciphertext) = wire.split_at(IV_SIZE);
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt then base64-encode, the transport form used on the relay path.
pub fn encrypt_base64(key: &[u8; 32], plaintext: &[u8]) -> String {
    BASE64.encode(encrypt(key, plaintext))
}

/// Base64-decode then decrypt.
pub fn decrypt_base64(key: &[u8; 32], encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let wire = BASE64.decode(encoded).map_err(|_| CryptoError::InvalidEncoding)?;
    decrypt(key, &wire)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_master_secret_derives_identical_keys() {
        let ms = generate_master_secret();
        assert_eq!(derive_key(&ms, "auth"), derive_key(&ms, "auth"));
        assert_ne!(derive_key(&ms, "auth"), derive_key(&ms, "encrypt"));
        assert_eq!(derive_relay_topic(&ms), derive_relay_topic(&ms));
        assert_eq!(derive_session_id(&ms), derive_session_id(&ms));
    }

    #[test]
    fn session_id_is_24_hex_chars() {
        let ms = [7u8; 32];
        let id = derive_session_id(&ms);
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn relay_topic_has_expected_prefix_and_length() {
        let ms = [1u8; 32];
        let topic = derive_relay_topic(&ms);
        assert!(topic.starts_with("ras-"));
        assert_eq!(topic.len(), "ras-".len() + 12);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [42u8; 32];
        for msg in [&b""[..], b"hello", b"a slightly longer plaintext payload"] {
            let wire = encrypt(&key, msg);
            assert_eq!(decrypt(&key, &wire).unwrap(), msg);
        }
    }

    #[test]
    fn two_encryptions_use_different_ivs() {
        let key = [9u8; 32];
        let a = encrypt(&key, b"same plaintext");
        let b = encrypt(&key, b"same plaintext");
        assert_ne!(&a[..12], &b[..12]);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let key = [1u8; 32];
        let wrong = [2u8; 32];
        let wire = encrypt(&key, b"secret");
        assert!(decrypt(&wrong, &wire).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let key = [5u8; 32];
        let mut wire = encrypt(&key, b"secret payload");
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(decrypt(&key, &wire).is_err());
    }

    #[test]
    fn minimum_decryptable_size_is_28_bytes() {
        let key = [3u8; 32];
        let wire = encrypt(&key, b"");
        assert_eq!(wire.len(), MIN_ENCRYPTED_SIZE);
        assert!(decrypt(&key, &wire[..27]).is_err());
    }

    #[test]
    fn hmac_verify_accepts_correct_and_rejects_tampered() {
        let key = [11u8; 32];
        let tag = compute_signaling_hmac(&key, "sess-1", 1_700_000_000, b"body");
        assert!(verify_signaling_hmac(&key, "sess-1", 1_700_000_000, b"body", &tag));
        assert!(!verify_signaling_hmac(&key, "sess-1", 1_700_000_001, b"body", &tag));
        let mut bad_tag = tag.clone();
        bad_tag[0] ^= 1;
        assert!(!verify_signaling_hmac(&key, "sess-1", 1_700_000_000, b"body", &bad_tag));
    }

    #[test]
    fn pair_request_and_response_proofs_are_domain_separated() {
        let key = [4u8; 32];
        let nonce = random_bytes(32);
        let req = pair_request_proof(&key, "sess", "device-1", &nonce);
        let resp = pair_response_proof(&key, &nonce);
        assert_ne!(req, resp);
    }
}
