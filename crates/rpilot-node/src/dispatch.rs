//! Key-based dispatch of incoming envelopes.
//!
//! A [`Dispatcher`] owns an immutable handler table built once by
//! [`DispatcherBuilder`]. Every accepted message runs on its own tokio task,
//! so a slow or failing handler never blocks reception of the next message.
//! A semaphore bounds the number of handlers in flight; when it is exhausted
//! `dispatch` waits for a free slot, which back-pressures the receive loop
//! instead of spawning unbounded work.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use rpilot_protocol::{decode, Address, Envelope, MessageKey, ProtocolError};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A handler receives the envelope's `(target, value)`.
pub type Handler = Arc<dyn Fn(Address, Value) -> HandlerFuture + Send + Sync>;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// How long [`Dispatcher::drain`] waits for running handlers.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

/// A message accepted for handling.
#[derive(Debug)]
pub struct Dispatched {
    pub key: MessageKey,
    pub target: Address,
    pub id: Option<String>,
    /// The handler task. Dropping it does not cancel the handler.
    pub handle: JoinHandle<()>,
}

pub struct DispatcherBuilder {
    name: &'static str,
    handlers: HashMap<MessageKey, Handler>,
    max_in_flight: usize,
    drain_timeout: Duration,
}

impl DispatcherBuilder {
    /// `name` labels log lines, e.g. "intake" or "funnel".
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: HashMap::new(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Register the handler for `key`, replacing any earlier one.
    pub fn on<F, Fut>(mut self, key: MessageKey, handler: F) -> Self
    where
        F: Fn(Address, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |target: Address, value: Value| -> HandlerFuture {
            Box::pin(handler(target, value))
        });
        self.handlers.insert(key, handler);
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            name: self.name,
            handlers: Arc::new(self.handlers),
            permits: Arc::new(Semaphore::new(self.max_in_flight)),
            max_in_flight: self.max_in_flight,
            drain_timeout: self.drain_timeout,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    name: &'static str,
    handlers: Arc<HashMap<MessageKey, Handler>>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    drain_timeout: Duration,
}

impl Dispatcher {
    pub fn handles(&self, key: MessageKey) -> bool {
        self.handlers.contains_key(&key)
    }

    pub fn keys(&self) -> Vec<MessageKey> {
        let mut keys: Vec<MessageKey> = self.handlers.keys().copied().collect();
        keys.sort_by_key(|k| k.as_str());
        keys
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Decode a raw payload and dispatch it. Malformed payloads and unknown
    /// keys are logged and returned as errors; they never reach a handler.
    pub async fn dispatch(&self, payload: &[u8]) -> Result<Dispatched, DispatchError> {
        let envelope = decode(payload).map_err(|e| {
            tracing::warn!(
                channel = self.name,
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "Dropping malformed message"
            );
            e
        })?;
        self.dispatch_envelope(envelope).await
    }

    pub async fn dispatch_envelope(&self, envelope: Envelope) -> Result<Dispatched, DispatchError> {
        let handler = envelope
            .kind()
            .ok()
            .and_then(|key| self.handlers.get(&key).map(|h| (key, Arc::clone(h))));
        let Some((key, handler)) = handler else {
            tracing::warn!(channel = self.name, key = %envelope.key, "No handler for key, message dropped");
            return Err(ProtocolError::UnknownKey(envelope.key).into());
        };

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::ShuttingDown)?;

        let Envelope { target, value, id, .. } = envelope;
        tracing::info!(
            channel = self.name,
            key = %key,
            target_addr = %target,
            id = id.as_deref().unwrap_or("-"),
            "Dispatching"
        );

        let channel = self.name;
        let handler_target = target.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = handler(handler_target, value).await {
                tracing::warn!(channel, key = %key, error = %e, "Handler failed");
            }
            drop(permit);
        });

        Ok(Dispatched {
            key,
            target,
            id,
            handle,
        })
    }

    /// Stop accepting new messages and wait, up to the drain timeout, for
    /// running handlers to finish. Returns false if some were still running;
    /// they are detached, not aborted.
    pub async fn drain(&self) -> bool {
        let max = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        let drained =
            match tokio::time::timeout(self.drain_timeout, self.permits.acquire_many(max)).await {
                Ok(Ok(all)) => {
                    all.forget();
                    true
                }
                // Closed by an earlier drain.
                Ok(Err(_)) => true,
                Err(_) => {
                    tracing::warn!(
                        channel = self.name,
                        in_flight = self.in_flight(),
                        "Drain timed out, handlers left running"
                    );
                    false
                }
            };
        self.permits.close();
        tracing::debug!(channel = self.name, drained, "Dispatcher drained");
        drained
    }
}
