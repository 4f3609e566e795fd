//! rpilot Node - the Terminal coordinator and Pilot worker assemblies.
//!
//! The Terminal owns the subscriber registry, the outbox of unacknowledged
//! commands and their retry timers. Pilots dispatch broadcast commands to
//! their task handlers and acknowledge every command that carries an id.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod outbox;
pub mod pilot;
pub mod registry;
pub mod terminal;

pub use config::NodeConfig;
pub use dispatch::{DispatchError, Dispatched, Dispatcher, DispatcherBuilder};
pub use error::NodeError;
pub use outbox::{Outbox, RetryDecision, RetryPolicy};
pub use pilot::{Pilot, PilotBuilder};
pub use registry::{DiscoveryReport, DiscoverySchedule, SubscriberRegistry};
pub use terminal::{EventKind, Terminal, TerminalEvent, TerminalSettings};
