//! The Terminal node: coordinator side of the control plane.
//!
//! Commands from local callers arrive on the intake channel and are turned
//! into reliable broadcasts. Reports and acknowledgments from Pilots arrive
//! on the funnel channel. Both channels are served by their own immutable
//! dispatcher:
//!
//! | channel | keys                                            |
//! |---------|-------------------------------------------------|
//! | intake  | PING, INIT, START, CHANGE, STOP, STOPALL, RECVD |
//! | funnel  | DATA, ALIVE, EVENT, STATE, COHERE, RECVD        |
//!
//! Everything a caller needs to observe (liveness, failures, reports) is
//! published as a [`TerminalEvent`] on the observer channel returned by
//! [`Terminal::new`].

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use rpilot_network::{BroadcastSender, Inbound};
use rpilot_protocol::{encode, Address, Envelope, MessageKey};

use crate::dispatch::{
    DispatchError, Dispatched, Dispatcher, DispatcherBuilder, DEFAULT_DRAIN_TIMEOUT,
    DEFAULT_MAX_IN_FLIGHT,
};
use crate::outbox::{Outbox, RetryDecision, RetryPolicy};
use crate::registry::{DiscoveryReport, DiscoverySchedule, SubscriberRegistry};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A notification for whoever drives the Terminal (GUI, CLI, logger).
#[derive(Debug, Clone)]
pub struct TerminalEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A Pilot answered a PING.
    Alive(Address),
    /// An expected Pilot never answered discovery.
    Dead(Address),
    /// A reliable command was acknowledged.
    Confirmed { id: String, key: String },
    /// A reliable command ran out of retries.
    DeliveryFailed { id: String, envelope: Envelope },
    /// DATA, EVENT, STATE or COHERE pushed by a Pilot.
    Report {
        key: MessageKey,
        from: Address,
        value: Value,
    },
}

#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub retry: RetryPolicy,
    pub discovery: DiscoverySchedule,
    /// Handlers allowed to run at once, per channel.
    pub max_in_flight: usize,
    /// Shutdown wait for running handlers.
    pub drain_timeout: Duration,
    /// Observer queue size; notifications beyond it are dropped.
    pub event_capacity: usize,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            discovery: DiscoverySchedule::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// State owned by one Terminal and shared with its handlers and timers.
struct Core {
    publisher: Arc<dyn BroadcastSender>,
    registry: SubscriberRegistry,
    outbox: Outbox,
    retry: RetryPolicy,
    discovery: DiscoverySchedule,
    next_id: AtomicU64,
    events: mpsc::Sender<TerminalEvent>,
}

impl Core {
    fn notify(&self, kind: EventKind) {
        let event = TerminalEvent {
            timestamp: Utc::now(),
            kind,
        };
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event = ?event.kind, "Observer queue full, notification dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("No observer attached");
            }
        }
    }

    /// Put an envelope on the broadcast channel. Failures are logged only:
    /// a reliable command keeps its retry schedule.
    fn transmit(&self, envelope: &Envelope) {
        if let Err(e) = self.publisher.send(&envelope.target, encode(envelope)) {
            tracing::warn!(
                id = envelope.id.as_deref().unwrap_or("-"),
                target_addr = %envelope.target,
                error = %e,
                "Broadcast send failed"
            );
        }
    }

    fn send_reliable(self: &Arc<Self>, target: Address, key: MessageKey, value: Value) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let envelope = Envelope::new(key, target.clone(), value).with_id(id.clone());

        if !target.is_broadcast() && !self.registry.contains(&target) {
            tracing::warn!(id = %id, target_addr = %target, "Publishing to unconfirmed target");
        }

        let generation = self.outbox.insert(envelope.clone()).unwrap_or_default();
        tracing::info!(id = %id, key = %key, target_addr = %target, "Publish");
        self.transmit(&envelope);
        self.schedule_retry(id.clone(), generation);
        id
    }

    fn schedule_retry(self: &Arc<Self>, id: String, generation: u64) {
        let core = Arc::clone(self);
        let interval = self.retry.interval;
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            core.on_timer_fire(&timer_id);
        });
        self.outbox.arm(&id, generation, timer.abort_handle());
    }

    fn on_timer_fire(self: &Arc<Self>, id: &str) {
        match self.outbox.fire(id) {
            RetryDecision::Missing => {
                tracing::debug!(id = %id, "Retry timer fired for settled message");
            }
            RetryDecision::Expired(envelope) => {
                tracing::warn!(
                    id = %id,
                    key = %envelope.key,
                    target_addr = %envelope.target,
                    "Publish failed, retry budget exhausted"
                );
                self.notify(EventKind::DeliveryFailed {
                    id: id.to_string(),
                    envelope,
                });
            }
            RetryDecision::Resend {
                envelope,
                generation,
            } => {
                tracing::info!(
                    id = %id,
                    key = %envelope.key,
                    target_addr = %envelope.target,
                    ttl = envelope.ttl.unwrap_or_default(),
                    "Republish"
                );
                self.transmit(&envelope);
                self.schedule_retry(id.to_string(), generation);
            }
        }
    }

    fn on_recvd(&self, id: &str) -> bool {
        match self.outbox.acknowledge(id) {
            Some(envelope) => {
                tracing::info!(id = %id, "Confirmed message");
                self.notify(EventKind::Confirmed {
                    id: id.to_string(),
                    key: envelope.key,
                });
                true
            }
            None => {
                tracing::warn!(id = %id, "Acknowledgment for unknown message, ignored");
                false
            }
        }
    }

    fn on_alive(&self, value: &Value) {
        for address in addresses_from_value(value) {
            if self.registry.insert(address.clone()) {
                tracing::info!(pilot = %address, "Pilot registered");
            } else {
                tracing::debug!(pilot = %address, "Pilot still alive");
            }
            self.notify(EventKind::Alive(address));
        }
    }

    async fn discover(&self, expected: BTreeSet<Address>) -> DiscoveryReport {
        let schedule = &self.discovery;
        self.registry.set_expected(expected.iter().cloned());
        tracing::info!(expected = expected.len(), "Discovery started");

        let ping = Envelope::new(MessageKey::Ping, Address::broadcast(), json!(""));
        // The first round always goes out, even when every expected Pilot is
        // already registered.
        for round in 0..schedule.broadcast_rounds {
            tracing::debug!(round, "Broadcast PING");
            self.transmit(&ping);
            tokio::time::sleep(schedule.broadcast_interval).await;
            if !expected.is_empty() && self.registry.missing_from(&expected).is_empty() {
                break;
            }
        }

        let mut missing = self.registry.missing_from(&expected);
        for round in 0..schedule.directed_rounds {
            if missing.is_empty() {
                break;
            }
            for address in &missing {
                tracing::debug!(round, pilot = %address, "Directed PING");
                self.transmit(&Envelope::new(MessageKey::Ping, address.clone(), json!("")));
            }
            tokio::time::sleep(schedule.directed_interval).await;
            missing = self.registry.missing_from(&expected);
        }

        for address in &missing {
            tracing::warn!(pilot = %address, "Requested Pilot was not heard from");
            self.notify(EventKind::Dead(address.clone()));
        }

        let alive = expected.difference(&missing).cloned().collect();
        tracing::info!(dead = missing.len(), "Discovery finished");
        DiscoveryReport {
            alive,
            dead: missing,
        }
    }
}

/// Addresses carried by an ALIVE or INIT value: a single name or a list.
fn addresses_from_value(value: &Value) -> Vec<Address> {
    let names: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    names
        .into_iter()
        .filter_map(|name| match name.as_str().map(Address::new) {
            Some(Ok(address)) => Some(address),
            _ => {
                tracing::warn!(value = %name, "Ignoring invalid Pilot address");
                None
            }
        })
        .collect()
}

/// The message id carried by a RECVD value.
fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Adapt a handler that needs the Terminal core to the dispatcher's
/// `(target, value)` shape.
fn with_core<F, Fut>(
    core: &Arc<Core>,
    handler: F,
) -> impl Fn(Address, Value) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<Core>, Address, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let core = Arc::clone(core);
    move |target, value| handler(Arc::clone(&core), target, value)
}

async fn acknowledge(core: Arc<Core>, _target: Address, value: Value) -> anyhow::Result<()> {
    let Some(id) = id_from_value(&value) else {
        anyhow::bail!("RECVD without a message id: {value}");
    };
    core.on_recvd(&id);
    Ok(())
}

async fn forward_command(
    core: Arc<Core>,
    key: MessageKey,
    target: Address,
    value: Value,
) -> anyhow::Result<()> {
    core.send_reliable(target, key, value);
    Ok(())
}

async fn report(core: Arc<Core>, key: MessageKey, from: Address, value: Value) -> anyhow::Result<()> {
    core.notify(EventKind::Report { key, from, value });
    Ok(())
}

fn command_dispatcher(core: &Arc<Core>, settings: &TerminalSettings) -> Dispatcher {
    DispatcherBuilder::new("intake")
        .max_in_flight(settings.max_in_flight)
        .drain_timeout(settings.drain_timeout)
        .on(
            MessageKey::Ping,
            with_core(core, |core, target, _| forward_command(core, MessageKey::Ping, target, json!(""))),
        )
        .on(
            MessageKey::Init,
            with_core(core, |core, _target, value| async move {
                let expected = addresses_from_value(&value).into_iter().collect();
                core.discover(expected).await;
                Ok(())
            }),
        )
        .on(
            MessageKey::Start,
            with_core(core, |core, target, value| forward_command(core, MessageKey::Start, target, value)),
        )
        .on(
            MessageKey::Change,
            with_core(core, |core, target, value| forward_command(core, MessageKey::Change, target, value)),
        )
        .on(
            MessageKey::Stop,
            with_core(core, |core, target, value| forward_command(core, MessageKey::Stop, target, value)),
        )
        .on(
            MessageKey::Stopall,
            with_core(core, |core, _target, value| {
                forward_command(core, MessageKey::Stop, Address::broadcast(), value)
            }),
        )
        .on(MessageKey::Recvd, with_core(core, acknowledge))
        .build()
}

fn report_dispatcher(core: &Arc<Core>, settings: &TerminalSettings) -> Dispatcher {
    DispatcherBuilder::new("funnel")
        .max_in_flight(settings.max_in_flight)
        .drain_timeout(settings.drain_timeout)
        .on(
            MessageKey::Data,
            with_core(core, |core, from, value| report(core, MessageKey::Data, from, value)),
        )
        .on(
            MessageKey::Alive,
            with_core(core, |core, _from, value| async move {
                core.on_alive(&value);
                Ok(())
            }),
        )
        .on(
            MessageKey::Event,
            with_core(core, |core, from, value| report(core, MessageKey::Event, from, value)),
        )
        .on(
            MessageKey::State,
            with_core(core, |core, from, value| report(core, MessageKey::State, from, value)),
        )
        .on(
            MessageKey::Cohere,
            with_core(core, |core, from, value| report(core, MessageKey::Cohere, from, value)),
        )
        .on(MessageKey::Recvd, with_core(core, acknowledge))
        .build()
}

/// Coordinator node. Cloning shares the same registry, outbox and
/// dispatchers.
#[derive(Clone)]
pub struct Terminal {
    core: Arc<Core>,
    commands: Dispatcher,
    reports: Dispatcher,
}

impl Terminal {
    /// Create a Terminal publishing on `publisher`. Returns the node and the
    /// receiving end of its observer channel.
    pub fn new(
        publisher: Arc<dyn BroadcastSender>,
        settings: TerminalSettings,
    ) -> (Self, mpsc::Receiver<TerminalEvent>) {
        let (events, events_rx) = mpsc::channel(settings.event_capacity.max(1));
        let core = Arc::new(Core {
            publisher,
            registry: SubscriberRegistry::new(),
            outbox: Outbox::new(settings.retry.budget),
            retry: settings.retry.clone(),
            discovery: settings.discovery.clone(),
            next_id: AtomicU64::new(0),
            events,
        });
        let commands = command_dispatcher(&core, &settings);
        let reports = report_dispatcher(&core, &settings);
        (
            Self {
                core,
                commands,
                reports,
            },
            events_rx,
        )
    }

    /// Send a command that is re-sent until a matching RECVD arrives or the
    /// retry budget runs out. Returns the allocated message id.
    pub fn send_reliable(&self, target: Address, key: MessageKey, value: Value) -> String {
        self.core.send_reliable(target, key, value)
    }

    /// Settle the outbox entry for `id`. Returns false (with a warning) for
    /// an unknown or already settled id.
    pub fn on_recvd(&self, id: &str) -> bool {
        self.core.on_recvd(id)
    }

    /// Run the bounded discovery handshake for `expected`.
    pub async fn discover(&self, expected: impl IntoIterator<Item = Address>) -> DiscoveryReport {
        self.core.discover(expected.into_iter().collect()).await
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.core.registry
    }

    pub fn outbox(&self) -> &Outbox {
        &self.core.outbox
    }

    /// Dispatch one payload from the local intake channel.
    pub async fn handle_command(&self, payload: &[u8]) -> Result<Dispatched, DispatchError> {
        self.commands.dispatch(payload).await
    }

    /// Dispatch one payload from the funnel channel.
    pub async fn handle_report(&self, payload: &[u8]) -> Result<Dispatched, DispatchError> {
        self.reports.dispatch(payload).await
    }

    /// Serve both inbound channels until they close, then wait for running
    /// handlers.
    pub async fn run(self, mut intake: Inbound, mut funnel: Inbound) {
        tracing::info!("Terminal running");
        let mut intake_open = true;
        let mut funnel_open = true;

        while intake_open || funnel_open {
            tokio::select! {
                payload = intake.recv(), if intake_open => match payload {
                    // Errors are logged by the dispatcher.
                    Some(payload) => { let _ = self.handle_command(&payload).await; }
                    None => intake_open = false,
                },
                payload = funnel.recv(), if funnel_open => match payload {
                    Some(payload) => { let _ = self.handle_report(&payload).await; }
                    None => funnel_open = false,
                },
            }
        }

        self.commands.drain().await;
        self.reports.drain().await;
        tracing::info!(pending = self.core.outbox.len(), "Terminal stopped");
    }
}
