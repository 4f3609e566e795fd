//! rpilot Network - transport bindings for the control plane.
//!
//! Three logical channels connect the Terminal to its Pilots:
//! - **broadcast**: Terminal → Pilots, filtered by target address
//! - **funnel**: Pilots → Terminal, many-to-one
//! - **intake**: local callers → a node, many-to-one
//!
//! Sends never block the caller. Received frames are handed to the owning
//! node through a bounded `tokio::sync::mpsc` receiver, so delivery always
//! happens on the receiver's task rather than the sender's.

pub mod channel;
pub mod error;
pub mod memory;
pub mod tcp;

pub use channel::{BroadcastSender, Filters, Frame, FunnelSender, Inbound};
pub use error::NetworkError;
pub use memory::{MemoryHub, MemoryPublisher, MemoryPusher};
pub use tcp::{TcpOptions, TcpPublisher, TcpPusher};
