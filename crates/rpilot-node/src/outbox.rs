//! Outbox of unacknowledged commands and the retry state machine.
//!
//! Each entry owns the abort handle of its pending retry timer. All state
//! transitions happen under one lock, so an acknowledgment and a timer
//! firing for the same id cannot both act on the entry: whichever takes the
//! lock second sees the result of the first.
//!
//! The retry budget (`ttl`) is initialised lazily on the first expiry. A
//! command acknowledged before its first timer never carries a `ttl`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::AbortHandle;

use rpilot_protocol::{Envelope, DEFAULT_RETRY_BUDGET, DEFAULT_RETRY_INTERVAL_MS};

/// How often and how many times an unacknowledged command is re-sent.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub budget: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

/// What the Terminal must do when a retry timer fires.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-send the envelope (its `ttl` already updated) and arm a new timer
    /// tagged with `generation`.
    Resend { envelope: Envelope, generation: u64 },
    /// Budget exhausted; the entry has been removed.
    Expired(Envelope),
    /// The id was acknowledged or expired earlier.
    Missing,
}

struct OutboxEntry {
    envelope: Envelope,
    /// Bumped on every fire, so a late `arm` for an older timer is ignored.
    generation: u64,
    timer: Option<AbortHandle>,
}

pub struct Outbox {
    entries: Mutex<HashMap<String, OutboxEntry>>,
    budget: i64,
}

impl Outbox {
    pub fn new(budget: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            budget,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, OutboxEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an outgoing envelope under its id. Returns the generation to
    /// pass to [`Outbox::arm`]. Envelopes without an id are not tracked.
    pub fn insert(&self, envelope: Envelope) -> Option<u64> {
        let id = envelope.id.clone()?;
        let previous = self.entries().insert(
            id,
            OutboxEntry {
                envelope,
                generation: 0,
                timer: None,
            },
        );
        if let Some(timer) = previous.and_then(|p| p.timer) {
            timer.abort();
        }
        Some(0)
    }

    /// Attach the retry timer for `generation`. If the entry is gone (an
    /// acknowledgment won the race) the timer is cancelled instead; if a
    /// newer generation exists the handle belongs to a timer that already
    /// fired and is dropped.
    pub fn arm(&self, id: &str, generation: u64, timer: AbortHandle) {
        let mut entries = self.entries();
        match entries.get_mut(id) {
            Some(entry) if entry.generation == generation => entry.timer = Some(timer),
            Some(_) => {}
            None => timer.abort(),
        }
    }

    /// Advance the retry state of `id` when its timer fires.
    pub fn fire(&self, id: &str) -> RetryDecision {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(id) else {
            return RetryDecision::Missing;
        };

        entry.timer = None;
        entry.generation += 1;
        let ttl = match entry.envelope.ttl {
            None => self.budget,
            Some(ttl) => ttl - 1,
        };
        entry.envelope.ttl = Some(ttl);

        if ttl <= 0 {
            return match entries.remove(id) {
                Some(entry) => RetryDecision::Expired(entry.envelope),
                None => RetryDecision::Missing,
            };
        }

        RetryDecision::Resend {
            envelope: entry.envelope.clone(),
            generation: entry.generation,
        }
    }

    /// Remove an acknowledged entry and cancel its timer. Returns `None` if
    /// the id is unknown. Cancelling is idempotent: an already fired or
    /// aborted timer is unaffected.
    pub fn acknowledge(&self, id: &str) -> Option<Envelope> {
        let entry = self.entries().remove(id)?;
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        Some(entry.envelope)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Ids still awaiting acknowledgment.
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BUDGET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpilot_protocol::{Address, MessageKey};
    use serde_json::json;

    fn command(id: &str) -> Envelope {
        Envelope::new(MessageKey::Start, Address::new("p1").unwrap(), json!({})).with_id(id)
    }

    #[test]
    fn test_budget_set_on_first_fire_then_decremented() {
        let outbox = Outbox::new(5);
        outbox.insert(command("0"));

        let RetryDecision::Resend { envelope, generation } = outbox.fire("0") else {
            panic!("expected resend");
        };
        assert_eq!(envelope.ttl, Some(5));
        assert_eq!(generation, 1);

        let RetryDecision::Resend { envelope, .. } = outbox.fire("0") else {
            panic!("expected resend");
        };
        assert_eq!(envelope.ttl, Some(4));
    }

    #[test]
    fn test_expires_after_budget() {
        let outbox = Outbox::new(5);
        outbox.insert(command("0"));
        let mut resends = 0;
        loop {
            match outbox.fire("0") {
                RetryDecision::Resend { .. } => resends += 1,
                RetryDecision::Expired(env) => {
                    assert_eq!(env.ttl, Some(0));
                    break;
                }
                RetryDecision::Missing => panic!("entry vanished early"),
            }
        }
        assert_eq!(resends, 5);
        assert!(!outbox.contains("0"));
        assert_eq!(outbox.fire("0"), RetryDecision::Missing);
    }

    #[test]
    fn test_acknowledge_twice() {
        let outbox = Outbox::default();
        outbox.insert(command("7"));
        assert!(outbox.acknowledge("7").is_some());
        assert!(outbox.acknowledge("7").is_none());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_fire_after_acknowledge_is_noop() {
        let outbox = Outbox::default();
        outbox.insert(command("1"));
        outbox.acknowledge("1");
        assert_eq!(outbox.fire("1"), RetryDecision::Missing);
    }

    #[test]
    fn test_untracked_without_id() {
        let outbox = Outbox::default();
        let env = Envelope::new(MessageKey::Ping, Address::broadcast(), json!(""));
        assert!(outbox.insert(env).is_none());
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn test_arm_after_acknowledge_cancels_timer() {
        let outbox = Outbox::default();
        outbox.insert(command("2"));
        outbox.acknowledge("2");

        let timer = tokio::spawn(std::future::pending::<()>());
        outbox.arm("2", 0, timer.abort_handle());
        let err = timer.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_acknowledge_cancels_armed_timer() {
        let outbox = Outbox::default();
        outbox.insert(command("3"));
        let timer = tokio::spawn(std::future::pending::<()>());
        outbox.arm("3", 0, timer.abort_handle());

        outbox.acknowledge("3");
        assert!(timer.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_stale_arm_is_ignored() {
        let outbox = Outbox::default();
        outbox.insert(command("4"));
        outbox.fire("4");

        let stale = tokio::spawn(std::future::pending::<()>());
        outbox.arm("4", 0, stale.abort_handle());
        outbox.acknowledge("4");
        // The stale handle was never attached, so acknowledging left it running.
        assert!(!stale.is_finished());
        stale.abort();
    }
}
