//! Message keys understood by the control plane.
//!
//! Terminal-bound commands arrive on the local intake channel, Pilot-bound
//! commands on the broadcast channel, and reports flow back over the funnel.
//! Each node builds its handler table from a subset of these keys.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKey {
    /// Liveness probe; a Pilot answers with `ALIVE`.
    Ping,
    /// Run the discovery handshake over an expected set of Pilots.
    Init,
    /// Start a task on a Pilot.
    Start,
    /// Change a running task's parameters.
    Change,
    /// Stop the current task on a Pilot.
    Stop,
    /// Stop every Pilot.
    Stopall,
    /// Acknowledgment carrying the id of a received command.
    Recvd,
    /// A whole trial's data.
    Data,
    /// A Pilot announcing itself in reply to `PING`.
    Alive,
    /// A single event within a trial.
    Event,
    /// A Pilot confirming or announcing a state change.
    State,
    /// A Pilot that never answered discovery.
    Dead,
    /// A Pilot's copy of its run data, sent at the end of a run so the
    /// Terminal can check it against its own.
    Cohere,
}

impl MessageKey {
    pub const ALL: [MessageKey; 13] = [
        Self::Ping,
        Self::Init,
        Self::Start,
        Self::Change,
        Self::Stop,
        Self::Stopall,
        Self::Recvd,
        Self::Data,
        Self::Alive,
        Self::Event,
        Self::State,
        Self::Dead,
        Self::Cohere,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Init => "INIT",
            Self::Start => "START",
            Self::Change => "CHANGE",
            Self::Stop => "STOP",
            Self::Stopall => "STOPALL",
            Self::Recvd => "RECVD",
            Self::Data => "DATA",
            Self::Alive => "ALIVE",
            Self::Event => "EVENT",
            Self::State => "STATE",
            Self::Dead => "DEAD",
            Self::Cohere => "COHERE",
        }
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKey(s.to_string()))
    }
}
