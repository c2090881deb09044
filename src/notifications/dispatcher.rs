//! Per-session cooldown dedup over matcher output, broadcasting the survivors
//! as terminal notification events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::constants::NOTIFICATION_COOLDOWN;
use crate::notifications::matcher::{MatchKind, MatchResult, Matcher, PatternSet};
use crate::terminal::{TerminalEvent, TerminalManager};

struct LastFired {
    at: Instant,
    kind: MatchKind,
}

struct SessionState {
    matcher: Matcher,
    last: Option<LastFired>,
}

pub struct NotificationDispatcher {
    terminal: Arc<TerminalManager>,
    cooldown: Duration,
    patterns: Arc<dyn Fn() -> anyhow::Result<PatternSet> + Send + Sync>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    pub fn new(terminal: Arc<TerminalManager>, patterns: Arc<dyn Fn() -> anyhow::Result<PatternSet> + Send + Sync>) -> Self {
        Self { terminal, cooldown: NOTIFICATION_COOLDOWN, patterns, sessions: Mutex::new(HashMap::new()) }
    }

    /// Feed one output chunk for `session_id` through its matcher and
    /// broadcast any surviving matches. Intended as the body of a
    /// [`crate::terminal::MatcherFeed`] closure.
    pub async fn feed(&self, session_id: String, chunk: Vec<u8>) {
        let results = {
            let mut sessions = self.sessions.lock().await;
            let entry = match sessions.entry(session_id.clone()) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => {
                    let patterns = match (self.patterns)() {
                        Ok(p) => p,
                        Err(e) => {
                            log::error!("failed to compile notification patterns: {e}");
                            return;
                        }
                    };
                    v.insert(SessionState { matcher: Matcher::new(patterns), last: None })
                }
            };
            entry.matcher.process_chunk(&chunk).await
        };

        for result in results {
            self.dispatch(&session_id, result).await;
        }
    }

    async fn dispatch(&self, session_id: &str, result: MatchResult) {
        let now = Instant::now();
        let suppressed = {
            let mut sessions = self.sessions.lock().await;
            let Some(state) = sessions.get_mut(session_id) else { return };
            let suppressed = should_suppress(state.last.as_ref().map(|l| (l.at, l.kind)), result.kind, now, self.cooldown);
            if !suppressed {
                state.last = Some(LastFired { at: now, kind: result.kind });
            }
            suppressed
        };
        if suppressed {
            return;
        }

        let (kind, title) = match result.kind {
            MatchKind::Approval => ("approval", "Approval requested"),
            MatchKind::Error => ("error", "Error detected"),
            MatchKind::Prompt => ("prompt", "Command finished"),
        };

        self.terminal
            .broadcast(
                session_id,
                TerminalEvent::Notification {
                    session_id: session_id.to_string(),
                    kind,
                    title: title.to_string(),
                    body: result.pattern,
                    snippet: result.snippet,
                    timestamp_ms: crate::notifications::now_millis(),
                },
            )
            .await;
    }

    pub async fn session_closed(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }
}

/// A candidate is suppressed if the same kind last fired within `cooldown`.
/// Different kinds never suppress each other, even inside the window.
fn should_suppress(last: Option<(Instant, MatchKind)>, kind: MatchKind, now: Instant, cooldown: Duration) -> bool {
    match last {
        Some((at, last_kind)) => last_kind == kind && now.duration_since(at) < cooldown,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> anyhow::Result<PatternSet> {
        PatternSet::compile(
            &[r"(?i)proceed\?\s*$".to_string()],
            &[r"(?i)\berror\b".to_string()],
            &[r"[$%#>]\s*$".to_string()],
        )
    }

    #[test]
    fn same_kind_within_cooldown_is_suppressed() {
        let now = Instant::now();
        let cooldown = Duration::from_secs(5);
        let suppressed = should_suppress(Some((now, MatchKind::Approval)), MatchKind::Approval, now + Duration::from_secs(2), cooldown);
        assert!(suppressed);
    }

    #[test]
    fn same_kind_after_cooldown_fires_again() {
        let now = Instant::now();
        let cooldown = Duration::from_secs(5);
        let suppressed = should_suppress(Some((now, MatchKind::Approval)), MatchKind::Approval, now + Duration::from_secs(6), cooldown);
        assert!(!suppressed);
    }

    #[test]
    fn different_kind_within_cooldown_still_fires() {
        let now = Instant::now();
        let cooldown = Duration::from_secs(5);
        let suppressed = should_suppress(Some((now, MatchKind::Approval)), MatchKind::Error, now + Duration::from_secs(1), cooldown);
        assert!(!suppressed);
    }

    #[tokio::test]
    async fn pattern_compile_failure_does_not_panic() {
        let bad: Arc<dyn Fn() -> anyhow::Result<PatternSet> + Send + Sync> = Arc::new(|| anyhow::bail!("bad pattern"));
        assert!(bad().is_err());
        assert!(patterns().is_ok());
    }
}
