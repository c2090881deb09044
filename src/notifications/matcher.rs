//! Notification matcher: turns raw pane output into `MatchResult`s.
//!
//! State: a sliding-window byte buffer, an "in alternate screen" flag (vim,
//! pagers — matching is suppressed while it's set), a "last chunk was just a
//! prompt" flag (avoids spamming on repeated redraws), and compiled pattern
//! sets for approval/error/shell-prompt. Every regex runs under a timeout so
//! a pathological pattern can't stall the output pipeline.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::timeout;

use crate::constants::{NOTIFICATION_REGEX_TIMEOUT, NOTIFICATION_SNIPPET_LEN, NOTIFICATION_WINDOW_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Approval,
    Error,
    Prompt,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub kind: MatchKind,
    pub pattern: String,
    pub snippet: String,
    pub position: usize,
}

fn alt_screen_enter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[\?(1049|47|1047)h").unwrap())
}

fn alt_screen_exit() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[\?(1049|47|1047)l").unwrap())
}

fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[()][A-Za-z0-9]").unwrap())
}

pub struct PatternSet {
    approval: Vec<Regex>,
    error: Vec<Regex>,
    prompt: Vec<Regex>,
}

impl PatternSet {
    pub fn compile(approval: &[String], error: &[String], prompt: &[String]) -> anyhow::Result<Self> {
        Ok(Self {
            approval: approval.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
            error: error.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
            prompt: prompt.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
        })
    }
}

pub struct Matcher {
    window: String,
    window_cap: usize,
    in_alternate_screen: bool,
    last_chunk_was_prompt: bool,
    patterns: PatternSet,
    regex_timeout: Duration,
}

impl Matcher {
    pub fn new(patterns: PatternSet) -> Self {
        Self {
            window: String::new(),
            window_cap: NOTIFICATION_WINDOW_BYTES,
            in_alternate_screen: false,
            last_chunk_was_prompt: false,
            patterns,
            regex_timeout: NOTIFICATION_REGEX_TIMEOUT,
        }
    }

    /// Feed one chunk of raw pane output, returning any matches it produced.
    pub async fn process_chunk(&mut self, chunk: &[u8]) -> Vec<MatchResult> {
        self.update_alternate_screen_flag(chunk);
        if self.in_alternate_screen {
            return Vec::new();
        }

        let decoded = String::from_utf8_lossy(chunk);
        let stripped = ansi_escape().replace_all(&decoded, "");

        self.window.push_str(&stripped);
        if self.window.len() > self.window_cap {
            let excess = self.window.len() - self.window_cap;
            let cut_at = self.window.char_indices().map(|(i, _)| i).find(|i| *i >= excess).unwrap_or(self.window.len());
            self.window.drain(..cut_at);
        }

        let mut results = Vec::new();
        results.extend(self.run_set(&self.patterns.approval.clone(), MatchKind::Approval).await);
        results.extend(self.run_set(&self.patterns.error.clone(), MatchKind::Error).await);

        let prompt_matches = self.run_set(&self.patterns.prompt.clone(), MatchKind::Prompt).await;
        let is_prompt_now = !prompt_matches.is_empty();
        if is_prompt_now && !self.last_chunk_was_prompt {
            results.extend(prompt_matches);
        }
        self.last_chunk_was_prompt = is_prompt_now;

        results
    }

    async fn run_set(&self, patterns: &[Regex], kind: MatchKind) -> Vec<MatchResult> {
        let mut results = Vec::new();
        for pattern in patterns {
            let source = pattern.as_str().to_string();
            let pattern = pattern.clone();
            let text = self.window.clone();
            let matched = timeout(self.regex_timeout, tokio::task::spawn_blocking(move || pattern.find(&text).map(|m| m.start()))).await;

            match matched {
                Ok(Ok(Some(position))) => {
                    results.push(MatchResult { kind, pattern: source, snippet: snippet_around(&self.window, position), position });
                }
                Ok(Ok(None)) => {}
                Ok(Err(_)) => log::warn!("notification pattern matcher task panicked"),
                Err(_) => log::warn!("notification pattern match exceeded {:?}, skipping", self.regex_timeout),
            }
        }
        results
    }

    fn update_alternate_screen_flag(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        if let Some(enter) = alt_screen_enter().find(&text) {
            let exit = alt_screen_exit().find(&text);
            self.in_alternate_screen = exit.map(|e| e.start() < enter.start()).map(|exit_first| !exit_first).unwrap_or(true);
        } else if alt_screen_exit().is_match(&text) {
            self.in_alternate_screen = false;
        }
    }
}

/// A ~50-char neighborhood around `position`, newlines collapsed, with
/// ellipses at truncation boundaries.
fn snippet_around(text: &str, position: usize) -> String {
    let half = NOTIFICATION_SNIPPET_LEN / 2;
    let chars: Vec<char> = text.chars().collect();
    let byte_to_char = text[..position.min(text.len())].chars().count();
    let start = byte_to_char.saturating_sub(half);
    let end = (byte_to_char + half).min(chars.len());

    let mut snippet: String = chars[start..end].iter().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ");
    if start > 0 {
        snippet = format!("...{snippet}");
    }
    if end < chars.len() {
        snippet.push_str("...");
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> PatternSet {
        PatternSet::compile(
            &[r"(?i)proceed\?\s*$".to_string()],
            &[r"(?i)\berror\b".to_string()],
            &[r"[$%#>]\s*$".to_string()],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn strips_ansi_before_matching() {
        let mut matcher = Matcher::new(patterns());
        let results = matcher.process_chunk(b"\x1b[31merror\x1b[0m: bad thing").await;
        assert!(results.iter().any(|r| r.kind == MatchKind::Error));
    }

    #[tokio::test]
    async fn suppresses_matching_inside_alternate_screen() {
        let mut matcher = Matcher::new(patterns());
        matcher.process_chunk(b"\x1b[?1049h").await;
        let results = matcher.process_chunk(b"error: should not fire").await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn exiting_alternate_screen_resumes_matching() {
        let mut matcher = Matcher::new(patterns());
        matcher.process_chunk(b"\x1b[?1049h").await;
        matcher.process_chunk(b"\x1b[?1049l").await;
        let results = matcher.process_chunk(b"error: now it should fire").await;
        assert!(results.iter().any(|r| r.kind == MatchKind::Error));
    }

    #[tokio::test]
    async fn repeated_prompt_redraws_fire_only_once() {
        let mut matcher = Matcher::new(patterns());
        let first = matcher.process_chunk(b"user@host $ ").await;
        assert!(first.iter().any(|r| r.kind == MatchKind::Prompt));
        let second = matcher.process_chunk(b"user@host $ ").await;
        assert!(!second.iter().any(|r| r.kind == MatchKind::Prompt));
    }
}
