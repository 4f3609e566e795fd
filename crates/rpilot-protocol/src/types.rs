use serde::{Deserialize, Serialize};

use crate::constants::{BROADCAST_ADDRESS, TERMINAL_ADDRESS};
use crate::ProtocolError;

/// Address of a node on the control plane.
///
/// A Pilot's address is its configured name. Two values are reserved:
/// [`BROADCAST_ADDRESS`] targets every Pilot, [`TERMINAL_ADDRESS`] targets
/// the Terminal's observer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Build an address, rejecting empty names and embedded whitespace
    /// (the TCP framing uses a tab to separate target from payload).
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidAddress(name));
        }
        Ok(Self(name))
    }

    pub fn broadcast() -> Self {
        Self(BROADCAST_ADDRESS.to_string())
    }

    pub fn terminal() -> Self {
        Self(TERMINAL_ADDRESS.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST_ADDRESS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl std::str::FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
