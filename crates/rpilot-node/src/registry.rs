//! Subscriber registry and the discovery schedule.
//!
//! The registry is the Terminal's set of Pilots that have answered a PING.
//! It only grows: a Pilot that goes quiet is reported by the next discovery
//! run, not evicted.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use rpilot_protocol::{
    Address, DEFAULT_BROADCAST_INTERVAL_MS, DEFAULT_BROADCAST_ROUNDS,
    DEFAULT_DIRECTED_INTERVAL_MS, DEFAULT_DIRECTED_ROUNDS,
};

#[derive(Debug, Default)]
struct RegistryState {
    alive: BTreeSet<Address>,
    /// Expected set from the most recent discovery run.
    expected: BTreeSet<Address>,
}

#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a live Pilot. Returns true if it was not known before.
    pub fn insert(&self, address: Address) -> bool {
        self.state().alive.insert(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.state().alive.contains(address)
    }

    pub fn len(&self) -> usize {
        self.state().alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().alive.is_empty()
    }

    pub fn snapshot(&self) -> BTreeSet<Address> {
        self.state().alive.clone()
    }

    pub fn set_expected(&self, expected: impl IntoIterator<Item = Address>) {
        self.state().expected = expected.into_iter().collect();
    }

    /// Addresses in `expected` that have not answered yet.
    pub fn missing_from(&self, expected: &BTreeSet<Address>) -> BTreeSet<Address> {
        let state = self.state();
        expected.difference(&state.alive).cloned().collect()
    }

    /// Addresses from the last discovery's expected set that are still
    /// missing.
    pub fn missing(&self) -> BTreeSet<Address> {
        let state = self.state();
        state.expected.difference(&state.alive).cloned().collect()
    }
}

/// Round counts and spacing of the discovery handshake.
#[derive(Debug, Clone)]
pub struct DiscoverySchedule {
    pub broadcast_rounds: u32,
    pub broadcast_interval: Duration,
    pub directed_rounds: u32,
    pub directed_interval: Duration,
}

impl Default for DiscoverySchedule {
    fn default() -> Self {
        Self {
            broadcast_rounds: DEFAULT_BROADCAST_ROUNDS,
            broadcast_interval: Duration::from_millis(DEFAULT_BROADCAST_INTERVAL_MS),
            directed_rounds: DEFAULT_DIRECTED_ROUNDS,
            directed_interval: Duration::from_millis(DEFAULT_DIRECTED_INTERVAL_MS),
        }
    }
}

impl DiscoverySchedule {
    /// Upper bound on how long one discovery run takes.
    pub fn max_duration(&self) -> Duration {
        self.broadcast_interval * self.broadcast_rounds
            + self.directed_interval * self.directed_rounds
    }
}

/// Outcome of one discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Expected Pilots that answered.
    pub alive: BTreeSet<Address>,
    /// Expected Pilots that never answered.
    pub dead: BTreeSet<Address>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(names: &[&str]) -> BTreeSet<Address> {
        names.iter().map(|n| Address::new(*n).unwrap()).collect()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let reg = SubscriberRegistry::new();
        assert!(reg.insert(Address::new("A").unwrap()));
        assert!(!reg.insert(Address::new("A").unwrap()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_missing_from_expected() {
        let reg = SubscriberRegistry::new();
        reg.insert(Address::new("A").unwrap());
        let missing = reg.missing_from(&addrs(&["A", "B", "C"]));
        assert_eq!(missing, addrs(&["B", "C"]));
    }

    #[test]
    fn test_missing_tracks_last_expected() {
        let reg = SubscriberRegistry::new();
        assert!(reg.missing().is_empty());
        reg.set_expected(addrs(&["A", "B"]));
        reg.insert(Address::new("B").unwrap());
        assert_eq!(reg.missing(), addrs(&["A"]));
    }

    #[test]
    fn test_concurrent_inserts_of_same_address() {
        let reg = std::sync::Arc::new(SubscriberRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = std::sync::Arc::clone(&reg);
                std::thread::spawn(move || reg.insert(Address::new("A").unwrap()))
            })
            .collect();
        let newly: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(newly, 1, "exactly one insert wins");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_default_schedule_bound() {
        assert_eq!(DiscoverySchedule::default().max_duration(), Duration::from_secs(15));
    }
}
