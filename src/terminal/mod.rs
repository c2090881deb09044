//! Terminal manager: attach/detach, input encoding, and the per-session
//! output pipeline (capture → circular buffer → fan-out to attachments and
//! the notification matcher).

pub mod buffer;
pub mod capture;
pub mod control_mode;
pub mod keys;
mod manager;

pub use buffer::{Chunk, OutputBuffer, OutputSkipped};
pub use keys::KeyType;
pub use manager::{AttachError, DetachReason, InputElement, MatcherFeed, TerminalEvent, TerminalEventEmitter, TerminalManager};
