//! Session-local attendance state.
//!
//! Every label that has been acted on this session has exactly one entry.
//! An entry is created before its first request is sent, so a label that is
//! still in flight is never submitted twice, even across overlapping ticks.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Where a label stands in this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Presence {
    /// Check-in request in flight.
    CheckingIn,
    CheckedIn,
    /// Checkout request in flight.
    CheckingOut,
    CheckedOut,
    /// A request failed; the label is not retried this session.
    Failed,
}

impl Presence {
    pub fn in_flight(self) -> bool {
        matches!(self, Presence::CheckingIn | Presence::CheckingOut)
    }
}

/// Request the caller must now send for a recognized label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    CheckIn,
    CheckOut,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    presence: Presence,
    since: Instant,
}

/// The checked-in set: label → presence.
#[derive(Debug)]
pub struct Session {
    entries: HashMap<String, Entry>,
    checkout_after: Duration,
}

/// Session shared between the checkin loop, submission tasks and D-Bus.
pub type SharedSession = Arc<Mutex<Session>>;

/// Lock a shared session; a panicked holder cannot leave the map half-written.
pub fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializable view of one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceRecord {
    pub label: String,
    pub presence: Presence,
    pub seconds_in_state: u64,
}

impl Session {
    /// `checkout_after` is the minimum time a label must have been checked in
    /// before a further recognition triggers its checkout.
    pub fn new(checkout_after: Duration) -> Self {
        Self { entries: HashMap::new(), checkout_after }
    }

    pub fn shared(checkout_after: Duration) -> SharedSession {
        Arc::new(Mutex::new(Self::new(checkout_after)))
    }

    /// Decide what a recognition of `label` at `now` should trigger, and mark
    /// the label as in flight if anything.
    pub fn claim(&mut self, label: &str, now: Instant) -> Option<Action> {
        match self.entries.get_mut(label) {
            None => {
                self.entries.insert(
                    label.to_string(),
                    Entry { presence: Presence::CheckingIn, since: now },
                );
                Some(Action::CheckIn)
            }
            Some(entry)
                if entry.presence == Presence::CheckedIn
                    && now.saturating_duration_since(entry.since) >= self.checkout_after =>
            {
                *entry = Entry { presence: Presence::CheckingOut, since: now };
                Some(Action::CheckOut)
            }
            Some(_) => None,
        }
    }

    /// Record the outcome of a request for `label`.
    pub fn settle(&mut self, label: &str, presence: Presence, now: Instant) {
        let entry = Entry { presence, since: now };
        match self.entries.get_mut(label) {
            Some(existing) => *existing = entry,
            None => {
                tracing::warn!(label, ?presence, "settling a label that was never claimed");
                self.entries.insert(label.to_string(), entry);
            }
        }
    }

    pub fn presence(&self, label: &str) -> Option<Presence> {
        self.entries.get(label).map(|e| e.presence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn in_flight(&self) -> usize {
        self.entries.values().filter(|e| e.presence.in_flight()).count()
    }

    /// All entries, sorted by label.
    pub fn records(&self, now: Instant) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .entries
            .iter()
            .map(|(label, e)| PresenceRecord {
                label: label.clone(),
                presence: e.presence,
                seconds_in_state: now.saturating_duration_since(e.since).as_secs(),
            })
            .collect();
        records.sort_by(|a, b| a.label.cmp(&b.label));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_recognition_claims_check_in_once() {
        let mut session = Session::new(Duration::ZERO);
        let now = Instant::now();
        assert_eq!(session.claim("An", now), Some(Action::CheckIn));
        assert_eq!(session.presence("An"), Some(Presence::CheckingIn));
        // In flight: nothing more, however often the face is seen.
        assert_eq!(session.claim("An", now), None);
        assert_eq!(session.claim("An", now + Duration::from_secs(30)), None);
        assert_eq!(session.len(), 1);
        assert_eq!(session.in_flight(), 1);
    }

    #[test]
    fn test_checked_in_label_claims_checkout_on_next_recognition() {
        let mut session = Session::new(Duration::ZERO);
        let now = Instant::now();
        session.claim("An", now);
        session.settle("An", Presence::CheckedIn, now);

        assert_eq!(session.claim("An", now), Some(Action::CheckOut));
        assert_eq!(session.presence("An"), Some(Presence::CheckingOut));
        assert_eq!(session.claim("An", now), None);
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn test_default_config_checks_out_on_next_tick() {
        let config = crate::config::Config::default();
        let mut session = Session::new(config.checkout_after());
        let t0 = Instant::now();
        assert_eq!(session.claim("An", t0), Some(Action::CheckIn));
        session.settle("An", Presence::CheckedIn, t0);

        let next_tick = t0 + config.poll_interval();
        assert_eq!(session.claim("An", next_tick), Some(Action::CheckOut));
    }

    #[test]
    fn test_checkout_waits_for_dwell_time() {
        let mut session = Session::new(Duration::from_secs(60));
        let t0 = Instant::now();
        session.claim("An", t0);
        session.settle("An", Presence::CheckedIn, t0);

        assert_eq!(session.claim("An", t0 + Duration::from_secs(3)), None);
        assert_eq!(session.presence("An"), Some(Presence::CheckedIn));
        assert_eq!(session.claim("An", t0 + Duration::from_secs(60)), Some(Action::CheckOut));
    }

    #[test]
    fn test_terminal_states_claim_nothing() {
        let mut session = Session::new(Duration::ZERO);
        let now = Instant::now();
        for (label, state) in [("Out", Presence::CheckedOut), ("Broken", Presence::Failed)] {
            session.claim(label, now);
            session.settle(label, state, now);
            assert_eq!(session.claim(label, now + Duration::from_secs(3600)), None);
        }
    }

    #[test]
    fn test_labels_are_never_duplicated() {
        let mut session = Session::new(Duration::ZERO);
        let now = Instant::now();
        for _ in 0..5 {
            for label in ["An", "Binh", "An", "Chi", "Binh"] {
                if let Some(action) = session.claim(label, now) {
                    let next = match action {
                        Action::CheckIn => Presence::CheckedIn,
                        Action::CheckOut => Presence::CheckedOut,
                    };
                    session.settle(label, next, now);
                }
            }
        }
        let records = session.records(now);
        let labels: Vec<&str> = records.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["An", "Binh", "Chi"]);
        assert!(records.iter().all(|r| r.presence == Presence::CheckedOut));
    }

    #[test]
    fn test_presence_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&Presence::CheckingIn).unwrap(), "\"checking-in\"");
        assert_eq!(serde_json::to_string(&Action::CheckOut).unwrap(), "\"check-out\"");
    }
}
