//! Signaling: the encrypted envelope exchanged over the relay and the
//! direct-HTTP path, its validation rules, the relay transport, and the
//! decrypt-validate-route handler.

pub mod envelope;
pub mod handler;
pub mod relay_client;
pub mod validator;

pub use envelope::{QrPayload, SignalEnvelope};
pub use handler::{Mode, SignalingCallbacks, SignalingHandler};
pub use relay_client::RelayClient;
pub use validator::{sanitize_device_name, NonceCache, ValidationError};
