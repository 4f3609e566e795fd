use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use rpilot_protocol::Address;

use crate::NetworkError;

/// Receiving end of any channel: raw payloads in arrival order per sender.
pub type Inbound = mpsc::Receiver<Bytes>;

/// A payload on the broadcast channel together with its target filter.
#[derive(Debug, Clone)]
pub struct Frame {
    pub target: Address,
    pub payload: Bytes,
}

/// Sending side of the fan-out channel (Terminal → Pilots).
///
/// Implementations must not block: a frame that cannot be queued is dropped
/// and reported through the returned error.
pub trait BroadcastSender: Send + Sync {
    fn send(&self, target: &Address, payload: Bytes) -> Result<(), NetworkError>;
}

/// Sending side of a many-to-one channel (Pilot → Terminal, or a local
/// caller → its node).
pub trait FunnelSender: Send + Sync {
    fn push(&self, payload: Bytes) -> Result<(), NetworkError>;
}

/// Subscription filters of one broadcast receiver, fixed when the receiver
/// is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    addresses: Vec<Address>,
    #[serde(default)]
    match_all: bool,
}

impl Filters {
    /// Own address plus the broadcast address, as every Pilot subscribes.
    pub fn for_node(name: &Address) -> Self {
        Self {
            addresses: vec![name.clone(), Address::broadcast()],
            match_all: false,
        }
    }

    /// Matches every frame. Used for monitoring taps.
    pub fn all() -> Self {
        Self {
            addresses: Vec::new(),
            match_all: true,
        }
    }

    pub fn matches(&self, target: &Address) -> bool {
        self.match_all || self.addresses.iter().any(|a| a == target)
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }
}
