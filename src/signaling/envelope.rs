//! The signaling envelope: the tagged variant carried encrypted over both
//! the relay and the direct-HTTP path.
//!
//! Serialized as JSON internally (simplest binary-schema-equivalent given the
//! rest of the wire stack already base64/JSON-encodes relay payloads); what
//! matters for interop is the field set and the HMAC/encryption framing
//! around it, not the serialization format itself.

use serde::{Deserialize, Serialize};

/// Top-level signaling message. Tag (`type`) discriminates the variant the
/// same way every other command envelope in this daemon does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalEnvelope {
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Capabilities(CapabilitiesPayload),
    PairRequest(PairRequestPayload),
    PairResponse(PairResponsePayload),
}

impl SignalEnvelope {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Offer(p) => &p.session_id,
            Self::Answer(p) => &p.session_id,
            Self::Capabilities(p) => &p.session_id,
            Self::PairRequest(p) => &p.session_id,
            Self::PairResponse(p) => &p.session_id,
        }
    }

    pub fn nonce(&self) -> &[u8] {
        match self {
            Self::Offer(p) => &p.nonce,
            Self::Answer(p) => &p.nonce,
            Self::Capabilities(p) => &p.nonce,
            Self::PairRequest(p) => &p.nonce,
            Self::PairResponse(p) => &p.nonce,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Offer(p) => p.timestamp,
            Self::Answer(p) => p.timestamp,
            Self::Capabilities(p) => p.timestamp,
            Self::PairRequest(p) => p.timestamp,
            Self::PairResponse(p) => p.timestamp,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Offer(_) => "OFFER",
            Self::Answer(_) => "ANSWER",
            Self::Capabilities(_) => "CAPABILITIES",
            Self::PairRequest(_) => "PAIR_REQUEST",
            Self::PairResponse(_) => "PAIR_RESPONSE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPayload {
    pub session_id: String,
    pub sdp: String,
    pub device_id: String,
    pub device_name: String,
    pub timestamp: u64,
    #[serde(with = "nonce_hex")]
    pub nonce: Vec<u8>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub session_id: String,
    pub sdp: String,
    pub timestamp: u64,
    #[serde(with = "nonce_hex")]
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesPayload {
    pub session_id: String,
    pub timestamp: u64,
    #[serde(with = "nonce_hex")]
    pub nonce: Vec<u8>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequestPayload {
    pub session_id: String,
    pub device_id: String,
    pub device_name: String,
    pub timestamp: u64,
    #[serde(with = "nonce_hex")]
    pub nonce: Vec<u8>,
    #[serde(with = "nonce_hex")]
    pub auth_proof: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairResponsePayload {
    pub session_id: String,
    pub daemon_device_id: String,
    pub hostname: String,
    pub timestamp: u64,
    #[serde(with = "nonce_hex")]
    pub nonce: Vec<u8>,
    #[serde(with = "nonce_hex")]
    pub auth_proof: Vec<u8>,
}

mod nonce_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        ser.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(de)?;
        if hex.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex"));
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| serde::de::Error::custom("invalid hex")))
            .collect()
    }
}

/// The QR pairing payload: `{version: 1, master_secret: 32 bytes}` plus
/// reserved legacy fields, base64 of the serialized binary form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrPayload {
    pub version: u8,
    #[serde(with = "nonce_hex")]
    pub master_secret: Vec<u8>,
}

impl QrPayload {
    pub fn new(master_secret: &crate::crypto::MasterSecret) -> Self {
        Self {
            version: 1,
            master_secret: master_secret.to_vec(),
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("QrPayload always serializes");
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, json)
    }

    pub fn decode(encoded: &str) -> anyhow::Result<Self> {
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = SignalEnvelope::Offer(OfferPayload {
            session_id: "abc".into(),
            sdp: "v=0\r\n".into(),
            device_id: "dev".into(),
            device_name: "Phone".into(),
            timestamp: 123,
            nonce: vec![1; 16],
            capabilities: vec!["terminal".into()],
        });
        let json = serde_json::to_string(&env).unwrap();
        let back: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id(), "abc");
        assert_eq!(back.nonce(), &[1u8; 16][..]);
        assert_eq!(back.type_name(), "OFFER");
    }

    #[test]
    fn qr_payload_round_trips() {
        let ms = [9u8; 32];
        let payload = QrPayload::new(&ms);
        let encoded = payload.encode();
        let decoded = QrPayload::decode(&encoded).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.master_secret, ms.to_vec());
    }
}
