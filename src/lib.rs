// Library modules
pub mod clipboard;
pub mod config;
pub mod connection_manager;
pub mod constants;
pub mod crypto;
pub mod device;
pub mod dispatcher;
pub mod embedded_tailscale;
pub mod env;
pub mod errors;
pub mod notifications;
pub mod orchestrator;
pub mod pairing;
pub mod peer;
pub mod reconnect;
pub mod sessions;
pub mod signaling;
pub mod tailscale;
pub mod terminal;
pub mod tmux;
pub mod wire;

pub use config::Config;
pub use device::{DeviceStore, PairedDevice};
pub use orchestrator::Orchestrator;
