//! Clipboard transfer: chunked image reassembly and text-paste approval,
//! backed by platform-specific clipboard commands.

pub mod manager;
pub mod platform;

pub use manager::{ClipboardEvent, ClipboardEventEmitter, ClipboardManager, ContentType};
