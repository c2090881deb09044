//! On-disk and in-memory representation of one multiplexer-backed session.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`SessionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Creating,
    Active,
    Killing,
}

/// One tracked session: the daemon's view of a detached multiplexer session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub mux_name: String,
    pub agent: String,
    pub directory: String,
    pub display_name: String,
    pub state: SessionState,
    pub created_at: u64,
    pub last_activity_at: u64,
}

impl SessionRecord {
    pub fn touch(&mut self, now: u64) {
        self.last_activity_at = now;
    }
}
