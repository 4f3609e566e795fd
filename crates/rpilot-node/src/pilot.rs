//! The Pilot node: worker side of the control plane.
//!
//! A Pilot subscribes to its own address and the broadcast address. PING is
//! answered internally with ALIVE; START, STOP and CHANGE go to task
//! handlers supplied by the embedding process. Every dispatched command that
//! carries an id is acknowledged with exactly one RECVD, whatever its
//! handler later does.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use rpilot_network::{Filters, FunnelSender, Inbound, NetworkError};
use rpilot_protocol::{decode, encode, Address, Envelope, MessageKey, ProtocolError};

use crate::dispatch::{DispatchError, Dispatched, Dispatcher, DispatcherBuilder};
use crate::NodeError;

fn push_envelope(
    pusher: &dyn FunnelSender,
    from: &Address,
    key: MessageKey,
    value: Value,
) -> Result<(), NetworkError> {
    pusher.push(encode(&Envelope::new(key, from.clone(), value)))
}

fn unhandled_task(
    key: MessageKey,
) -> impl Fn(Address, Value) -> std::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
    move |_, value| {
        tracing::info!(key = %key, value = %value, "No task handler installed, command ignored");
        std::future::ready(Ok(()))
    }
}

pub struct PilotBuilder {
    name: Address,
    pusher: Arc<dyn FunnelSender>,
    dispatcher: DispatcherBuilder,
}

impl PilotBuilder {
    fn new(name: Address, pusher: Arc<dyn FunnelSender>) -> Self {
        let ping_pusher = Arc::clone(&pusher);
        let ping_name = name.clone();
        let dispatcher = DispatcherBuilder::new("broadcast")
            .on(MessageKey::Ping, move |_, _| {
                let result = push_envelope(
                    ping_pusher.as_ref(),
                    &ping_name,
                    MessageKey::Alive,
                    json!(ping_name.as_str()),
                );
                async move { result.map_err(anyhow::Error::from) }
            })
            .on(MessageKey::Start, unhandled_task(MessageKey::Start))
            .on(MessageKey::Stop, unhandled_task(MessageKey::Stop))
            .on(MessageKey::Change, unhandled_task(MessageKey::Change));

        Self {
            name,
            pusher,
            dispatcher,
        }
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.dispatcher = self.dispatcher.max_in_flight(max_in_flight);
        self
    }

    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.dispatcher = self.dispatcher.drain_timeout(drain_timeout);
        self
    }

    /// Handler for START; receives the task description.
    pub fn on_start<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Address, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.dispatcher = self.dispatcher.on(MessageKey::Start, handler);
        self
    }

    pub fn on_stop<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Address, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.dispatcher = self.dispatcher.on(MessageKey::Stop, handler);
        self
    }

    pub fn on_change<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Address, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.dispatcher = self.dispatcher.on(MessageKey::Change, handler);
        self
    }

    pub fn build(self) -> Pilot {
        Pilot {
            name: self.name,
            pusher: self.pusher,
            dispatcher: self.dispatcher.build(),
        }
    }
}

#[derive(Clone)]
pub struct Pilot {
    name: Address,
    pusher: Arc<dyn FunnelSender>,
    dispatcher: Dispatcher,
}

impl Pilot {
    pub fn builder(name: Address, pusher: Arc<dyn FunnelSender>) -> PilotBuilder {
        PilotBuilder::new(name, pusher)
    }

    pub fn name(&self) -> &Address {
        &self.name
    }

    /// Broadcast filters this Pilot subscribes with.
    pub fn filters(&self) -> Filters {
        Filters::for_node(&self.name)
    }

    /// Push a report to the Terminal.
    pub fn push(&self, key: MessageKey, value: Value) -> Result<(), NetworkError> {
        push_envelope(self.pusher.as_ref(), &self.name, key, value)
    }

    /// Dispatch one payload from the broadcast channel and acknowledge it if
    /// it carries an id.
    pub async fn handle_broadcast(&self, payload: &[u8]) -> Result<Dispatched, DispatchError> {
        let dispatched = self.dispatcher.dispatch(payload).await?;
        if let Some(id) = &dispatched.id {
            if let Err(e) = self.push(MessageKey::Recvd, json!(id)) {
                tracing::warn!(id = %id, error = %e, "Failed to push acknowledgment");
            }
        }
        Ok(dispatched)
    }

    /// Forward a report handed over by the local task process.
    pub fn forward_local(&self, payload: &[u8]) -> Result<(), NodeError> {
        let envelope = decode(payload)?;
        match envelope.kind()? {
            key @ (MessageKey::Data | MessageKey::Event | MessageKey::State | MessageKey::Cohere) => {
                self.push(key, envelope.value)?;
                Ok(())
            }
            _ => Err(ProtocolError::UnknownKey(envelope.key).into()),
        }
    }

    /// Serve the broadcast and local intake channels until both close.
    pub async fn run(self, mut broadcast: Inbound, mut intake: Inbound) {
        tracing::info!(pilot = %self.name, "Pilot running");
        let mut broadcast_open = true;
        let mut intake_open = true;

        while broadcast_open || intake_open {
            tokio::select! {
                payload = broadcast.recv(), if broadcast_open => match payload {
                    Some(payload) => { let _ = self.handle_broadcast(&payload).await; }
                    None => broadcast_open = false,
                },
                payload = intake.recv(), if intake_open => match payload {
                    Some(payload) => {
                        if let Err(e) = self.forward_local(&payload) {
                            tracing::warn!(error = %e, "Local report not forwarded");
                        }
                    }
                    None => intake_open = false,
                },
            }
        }

        self.dispatcher.drain().await;
        tracing::info!(pilot = %self.name, "Pilot stopped");
    }
}
