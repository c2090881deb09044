//! Session manager: the multiplexer-session registry.
//!
//! Owns `id → SessionRecord` in memory and on disk, reconciles against the
//! multiplexer's own session list at startup and on every `list`, and
//! enforces the directory/agent/rate-limit/capacity rules a create goes
//! through before a detached multiplexer session is spawned.

mod manager;
mod record;

pub use manager::{RecentDirectories, SessionEvent, SessionEventEmitter, SessionManager};
pub use record::{SessionRecord, SessionState};
