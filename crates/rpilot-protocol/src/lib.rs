//! rpilot Protocol - Envelope, addressing and message keys
//!
//! Implements the wire format exchanged between the Terminal coordinator
//! and its Pilot workers: a JSON envelope `{key, target, value, id, ttl}`
//! carried over the broadcast, funnel and intake channels.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod types;

pub use constants::*;
pub use envelope::{decode, encode, Envelope};
pub use error::*;
pub use keys::MessageKey;
pub use types::Address;
