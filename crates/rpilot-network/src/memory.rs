//! In-process bindings.
//!
//! The broadcast channel is a `tokio::sync::broadcast` bus: a subscriber
//! that falls behind loses frames, the same silent-drop behaviour as a
//! network fan-out socket. Funnel and intake channels are bounded mpsc
//! queues.

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use rpilot_protocol::Address;

use crate::channel::{BroadcastSender, Filters, Frame, FunnelSender, Inbound};
use crate::NetworkError;

/// Owns the in-process broadcast bus and the Terminal's funnel queue.
pub struct MemoryHub {
    bus: broadcast::Sender<Frame>,
    funnel: mpsc::Sender<Bytes>,
    capacity: usize,
}

impl MemoryHub {
    /// Create a hub. Returns the hub and the funnel receiver the Terminal
    /// drains.
    pub fn new(capacity: usize) -> (Self, Inbound) {
        let (bus, _) = broadcast::channel(capacity);
        let (funnel, funnel_rx) = mpsc::channel(capacity);
        (
            Self {
                bus,
                funnel,
                capacity,
            },
            funnel_rx,
        )
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            bus: self.bus.clone(),
        }
    }

    pub fn pusher(&self) -> MemoryPusher {
        MemoryPusher {
            tx: self.funnel.clone(),
        }
    }

    /// Open a broadcast receiver. Frames published after this call returns
    /// are delivered when their target matches `filters`.
    ///
    /// Spawns a forwarding task, so it must be called inside a tokio runtime.
    pub fn subscribe(&self, filters: Filters) -> Inbound {
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(self.capacity);

        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(frame) => {
                        if !filters.matches(&frame.target) {
                            continue;
                        }
                        match tx.try_send(frame.payload) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!(target_addr = %frame.target, "Subscriber queue full, frame dropped");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Subscriber lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }

    /// A standalone many-to-one channel, used for local intake.
    pub fn line_channel(capacity: usize) -> (MemoryPusher, Inbound) {
        let (tx, rx) = mpsc::channel(capacity);
        (MemoryPusher { tx }, rx)
    }
}

#[derive(Clone)]
pub struct MemoryPublisher {
    bus: broadcast::Sender<Frame>,
}

impl BroadcastSender for MemoryPublisher {
    fn send(&self, target: &Address, payload: Bytes) -> Result<(), NetworkError> {
        let frame = Frame {
            target: target.clone(),
            payload,
        };
        // No subscribers is not an error for a fan-out channel.
        if self.bus.send(frame).is_err() {
            tracing::trace!(target_addr = %target, "Broadcast with no subscribers");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryPusher {
    tx: mpsc::Sender<Bytes>,
}

impl FunnelSender for MemoryPusher {
    fn push(&self, payload: Bytes) -> Result<(), NetworkError> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => NetworkError::ChannelClosed,
        })
    }
}
