//! Output-driven notifications: a sliding-window regex matcher over each
//! session's pane output, and a per-session cooldown dispatcher that turns
//! surviving matches into broadcast terminal events.

pub mod dispatcher;
pub mod matcher;

pub use dispatcher::NotificationDispatcher;
pub use matcher::{MatchKind, MatchResult, Matcher, PatternSet};

use crate::config::Config;

/// Build the compiled pattern set from the daemon's configured patterns.
/// Returned as a closure so the dispatcher can recompile on demand (e.g. a
/// future config-reload) without the caller re-reading the config file.
pub fn pattern_compiler(config: &Config) -> impl Fn() -> anyhow::Result<PatternSet> + Send + Sync + 'static {
    let approval = config.notification_approval_patterns.clone();
    let error = config.notification_error_patterns.clone();
    let prompt = config.notification_prompt_patterns.clone();
    move || PatternSet::compile(&approval, &error, &prompt)
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
