//! Message dispatcher: the top-level command-envelope router.
//!
//! Every connection's control channel carries JSON envelopes tagged by
//! `type`. Handlers are registered by variant name at startup and invoked
//! under a per-handler timeout, so one wedged handler (a multiplexer call
//! that hangs, say) never stalls the receive path for other connections or
//! other devices.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::constants::DISPATCH_HANDLER_TIMEOUT;

pub type HandlerFuture = BoxFuture<'static, ()>;
pub type Handler = Arc<dyn Fn(String, serde_json::Value) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    #[serde(rename = "type")]
    variant: String,
    #[serde(flatten)]
    payload: serde_json::Value,
}

/// Registry of handlers keyed by variant name (`session`, `terminal`,
/// `clipboard`, `ping`, `connection_ready`, ...).
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Handler>>,
    handler_timeout: std::time::Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DISPATCH_HANDLER_TIMEOUT)
    }
}

impl Dispatcher {
    pub fn new(handler_timeout: std::time::Duration) -> Self {
        Self { handlers: RwLock::new(HashMap::new()), handler_timeout }
    }

    pub async fn register(&self, variant: &str, handler: Handler) {
        self.handlers.write().await.insert(variant.to_string(), handler);
    }

    /// Parse the top-level envelope out of raw control-channel bytes and
    /// dispatch it. Malformed envelopes are logged and dropped; they never
    /// propagate as an error up to the connection's receive loop.
    pub async fn dispatch_raw(&self, device_id: &str, bytes: &[u8]) {
        let envelope: CommandEnvelope = match serde_json::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("malformed command envelope from {device_id}: {e}");
                return;
            }
        };
        self.dispatch(device_id, &envelope.variant, envelope.payload).await;
    }

    pub async fn dispatch(&self, device_id: &str, variant: &str, payload: serde_json::Value) {
        let handler = self.handlers.read().await.get(variant).cloned();
        let Some(handler) = handler else {
            log::warn!("unknown command variant {variant:?} from {device_id}");
            return;
        };

        let fut = handler(device_id.to_string(), payload);
        if timeout(self.handler_timeout, fut).await.is_err() {
            log::warn!("handler for {variant:?} timed out for device {device_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatches_to_the_registered_handler() {
        let dispatcher = Dispatcher::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        dispatcher
            .register(
                "ping",
                Arc::new(move |_device_id, _payload| {
                    let calls = Arc::clone(&calls_clone);
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await;

        dispatcher.dispatch_raw("dev-1", br#"{"type":"ping"}"#).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_variant_is_silently_dropped() {
        let dispatcher = Dispatcher::default();
        dispatcher.dispatch_raw("dev-1", br#"{"type":"nonsense"}"#).await;
    }

    #[tokio::test]
    async fn malformed_envelope_is_silently_dropped() {
        let dispatcher = Dispatcher::default();
        dispatcher.dispatch_raw("dev-1", b"not json").await;
    }

    #[tokio::test]
    async fn slow_handler_times_out_without_panicking() {
        let dispatcher = Dispatcher::new(std::time::Duration::from_millis(20));
        dispatcher
            .register(
                "terminal",
                Arc::new(|_device_id, _payload| {
                    Box::pin(async move {
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    })
                }),
            )
            .await;

        dispatcher.dispatch_raw("dev-1", br#"{"type":"terminal"}"#).await;
    }
}
