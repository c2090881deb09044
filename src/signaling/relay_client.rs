//! Relay (ntfy-style pub/sub) client: SSE subscribe with health tracking,
//! retrying publish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::{
    RELAY_HEALTH_RECONNECT_THRESHOLD, RELAY_HEALTH_WARN_THRESHOLD, RELAY_PUBLISH_BACKOFF,
    RELAY_PUBLISH_MAX_ATTEMPTS, RELAY_PUBLISH_TIMEOUT, RELAY_RECONNECT_DELAY,
};

#[derive(Debug, Deserialize)]
struct RelayEvent {
    #[allow(dead_code)]
    id: Option<String>,
    #[allow(dead_code)]
    time: Option<u64>,
    event: String,
    #[serde(default)]
    message: Option<String>,
}

/// Subscribes to `"<server>/<topic>/sse"` and forwards decoded message
/// bodies on a channel; tracks liveness for reconnect decisions and exposes
/// a retrying publish for the response path.
pub struct RelayClient {
    server_url: String,
    topic: String,
    http: reqwest::Client,
    last_event_unix: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient").field("topic", &self.topic).finish_non_exhaustive()
    }
}

impl RelayClient {
    pub fn new(server_url: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            topic: topic.into(),
            http: reqwest::Client::new(),
            last_event_unix: Arc::new(AtomicU64::new(now_unix())),
            stopped: Arc::new(AtomicBool::new(false)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the subscriber loop, forwarding each `event == "message"` body
    /// on `tx`. Runs until [`Self::stop`] is called; reconnects internally
    /// on health-timeout or stream errors.
    pub async fn subscribe(self: &Arc<Self>, tx: mpsc::Sender<String>) {
        let this = Arc::clone(self);
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }
        *guard = Some(tokio::spawn(async move {
            this.run_subscribe_loop(tx).await;
        }));
    }

    async fn run_subscribe_loop(&self, tx: mpsc::Sender<String>) {
        while !self.stopped.load(Ordering::SeqCst) {
            if let Err(e) = self.subscribe_once(&tx).await {
                log::warn!("relay subscriber for topic {} disconnected: {e:#}", self.topic);
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(RELAY_RECONNECT_DELAY).await;
        }
    }

    async fn subscribe_once(&self, tx: &mpsc::Sender<String>) -> Result<()> {
        let url = format!("{}/{}/sse", self.server_url.trim_end_matches('/'), self.topic);
        log::info!("subscribing to relay topic {} at {url}", self.topic);

        let response = self.http.get(&url).send().await.context("relay subscribe request failed")?;
        if !response.status().is_success() {
            bail!("relay subscribe returned HTTP {}", response.status());
        }
        self.touch();

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        let health = self.health_watchdog();
        tokio::pin!(health);

        loop {
            tokio::select! {
                _ = &mut health => {
                    bail!("no inbound event within reconnect threshold");
                }
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { bail!("relay stream ended") };
                    let chunk = chunk.context("relay stream read error")?;
                    buffer.extend_from_slice(&chunk);
                    self.touch();
                    self.drain_lines(&mut buffer, tx).await;
                }
            }
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    async fn drain_lines(&self, buffer: &mut Vec<u8>, tx: &mpsc::Sender<String>) {
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_start_matches("data:").trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<RelayEvent>(line) else {
                continue;
            };
            if event.event == "message" {
                if let Some(message) = event.message {
                    if !message.is_empty() {
                        let tx = tx.clone();
                        let message_clone = message.clone();
                        // Per-message processing is spawned so a slow consumer
                        // never stalls the SSE read loop.
                        tokio::spawn(async move {
                            let _ = tx.send(message_clone).await;
                        });
                    }
                }
            }
        }
    }

    async fn health_watchdog(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let idle = now_unix().saturating_sub(self.last_event_unix.load(Ordering::SeqCst));
            if idle >= RELAY_HEALTH_RECONNECT_THRESHOLD.as_secs() {
                return;
            }
            if idle >= RELAY_HEALTH_WARN_THRESHOLD.as_secs() {
                log::warn!("relay topic {} idle for {idle}s", self.topic);
            }
        }
    }

    fn touch(&self) {
        self.last_event_unix.store(now_unix(), Ordering::SeqCst);
    }

    /// Idempotent: calling `stop()` on an already-stopped subscriber is a no-op.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    /// Publish a base64 payload with retry: up to 3 attempts, `[1,2,4]s`
    /// backoff, 10s per-request timeout. Non-200 responses and network
    /// failures both count as a failed attempt.
    pub async fn publish(&self, payload_base64: &str) -> Result<()> {
        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.topic);
        let mut last_err = None;

        for attempt in 0..RELAY_PUBLISH_MAX_ATTEMPTS {
            let result = tokio::time::timeout(
                RELAY_PUBLISH_TIMEOUT,
                self.http.post(&url).header("content-type", "text/plain").body(payload_base64.to_string()).send(),
            )
            .await;

            match result {
                Ok(Ok(resp)) if resp.status().is_success() => return Ok(()),
                Ok(Ok(resp)) => last_err = Some(anyhow::anyhow!("relay publish returned HTTP {}", resp.status())),
                Ok(Err(e)) => last_err = Some(anyhow::Error::from(e)),
                Err(_) => last_err = Some(anyhow::anyhow!("relay publish timed out")),
            }

            if attempt + 1 < RELAY_PUBLISH_MAX_ATTEMPTS {
                tokio::time::sleep(RELAY_PUBLISH_BACKOFF[attempt]).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("relay publish failed")))
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_before_subscribe_is_idempotent() {
        let client = Arc::new(RelayClient::new("http://localhost:1", "topic"));
        client.stop().await;
        client.stop().await;
    }

    #[tokio::test]
    async fn publish_fails_against_unreachable_server() {
        let client = RelayClient::new("http://127.0.0.1:1", "topic");
        assert!(client.publish("cGF5bG9hZA==").await.is_err());
    }
}
