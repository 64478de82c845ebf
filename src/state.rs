//! Current state of every monitored host

use crate::debounce::{Decision, Phase};
use crate::probe::ProbeOutcome;
use crate::targets::Target;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostState {
    pub hostname: String,
    pub address: String,
    /// Last confirmed reachability, `None` until the host was first seen up
    /// or confirmed down
    pub reachable: Option<bool>,
    pub phase: Phase,
    pub latency_ms: Option<f64>,
    pub last_change: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl HostState {
    fn unknown(target: &Target) -> Self {
        Self {
            hostname: target.hostname.clone(),
            address: target.address.clone(),
            reachable: None,
            phase: Phase::Unknown,
            latency_ms: None,
            last_change: None,
            last_checked: None,
        }
    }
}

/// Immutable view handed to readers
pub type StateSnapshot = Arc<Vec<HostState>>;

/// Host states owned by the engine.
///
/// Readers never touch this directly; they receive a fresh
/// [`StateSnapshot`] through a watch channel each time the engine publishes.
#[derive(Debug)]
pub struct HostStateStore {
    states: Vec<HostState>,
    index: HashMap<String, usize>,
    publisher: watch::Sender<StateSnapshot>,
}

impl HostStateStore {
    pub fn new(targets: &[Target]) -> Self {
        let states: Vec<HostState> = targets.iter().map(HostState::unknown).collect();
        let index = targets
            .iter()
            .enumerate()
            .map(|(i, target)| (target.address.clone(), i))
            .collect();
        let (publisher, _) = watch::channel(Arc::new(states.clone()));

        Self {
            states,
            index,
            publisher,
        }
    }

    /// Fold one poll result into the state of `address`.
    ///
    /// `last_change` only moves when the decision confirmed a down or a
    /// return to up; while a host is pending it keeps showing its last
    /// confirmed state.
    pub fn apply(
        &mut self,
        address: &str,
        outcome: &ProbeOutcome,
        decision: &Decision,
        now: DateTime<Utc>,
    ) {
        let Some(&i) = self.index.get(address) else {
            return;
        };
        let state = &mut self.states[i];

        state.phase = decision.to;
        state.latency_ms = outcome.latency_ms;
        state.last_checked = Some(now);

        match decision.to {
            Phase::Up => state.reachable = Some(true),
            Phase::DownConfirmed => state.reachable = Some(false),
            Phase::DownPending | Phase::Unknown => {}
        }

        if decision.is_confirmed_change() {
            state.last_change = Some(now);
        }
    }

    pub fn get(&self, address: &str) -> Option<&HostState> {
        self.index.get(address).map(|&i| &self.states[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostState> {
        self.states.iter()
    }

    /// Make the current states visible to readers
    pub fn publish(&self) {
        self.publisher.send_replace(Arc::new(self.states.clone()));
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.publisher.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debounce::DebounceTracker;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn observe(
        store: &mut HostStateStore,
        tracker: &mut DebounceTracker,
        reachable: bool,
        t: i64,
    ) {
        let outcome = if reachable {
            ProbeOutcome::up(Some(1.0))
        } else {
            ProbeOutcome::down()
        };
        let decision = tracker.observe("10.0.0.1", reachable, at(t));
        store.apply("10.0.0.1", &outcome, &decision, at(t));
    }

    #[test]
    fn test_last_change_moves_only_on_confirmed_transitions() {
        let mut store = HostStateStore::new(&[Target::new("web1", "10.0.0.1")]);
        let mut tracker = DebounceTracker::new(Duration::from_secs(5));

        observe(&mut store, &mut tracker, true, 0);
        let state = store.get("10.0.0.1").unwrap();
        assert_eq!(state.reachable, Some(true));
        assert!(state.last_change.is_none());

        for t in 1..=5 {
            observe(&mut store, &mut tracker, false, t);
            let state = store.get("10.0.0.1").unwrap();
            assert_eq!(state.reachable, Some(true), "t={}", t);
            assert!(state.last_change.is_none(), "t={}", t);
            assert!(state.latency_ms.is_none());
        }

        observe(&mut store, &mut tracker, false, 6);
        let state = store.get("10.0.0.1").unwrap();
        assert_eq!(state.reachable, Some(false));
        assert_eq!(state.phase, Phase::DownConfirmed);
        assert_eq!(state.last_change, Some(at(6)));

        observe(&mut store, &mut tracker, false, 7);
        assert_eq!(store.get("10.0.0.1").unwrap().last_change, Some(at(6)));

        observe(&mut store, &mut tracker, true, 8);
        let state = store.get("10.0.0.1").unwrap();
        assert_eq!(state.reachable, Some(true));
        assert_eq!(state.last_change, Some(at(8)));
        assert_eq!(state.last_checked, Some(at(8)));
    }

    #[test]
    fn test_recovery_inside_grace_window_moves_last_change() {
        let mut store = HostStateStore::new(&[Target::new("web1", "10.0.0.1")]);
        let mut tracker = DebounceTracker::new(Duration::from_secs(300));

        observe(&mut store, &mut tracker, true, 0);
        observe(&mut store, &mut tracker, false, 10);
        assert!(store.get("10.0.0.1").unwrap().last_change.is_none());

        observe(&mut store, &mut tracker, true, 20);
        let state = store.get("10.0.0.1").unwrap();
        assert_eq!(state.reachable, Some(true));
        assert_eq!(state.phase, Phase::Up);
        assert_eq!(state.last_change, Some(at(20)));

        observe(&mut store, &mut tracker, true, 30);
        assert_eq!(store.get("10.0.0.1").unwrap().last_change, Some(at(20)));
    }

    #[test]
    fn test_pending_from_unknown_stays_unknown() {
        let mut store = HostStateStore::new(&[Target::new("web1", "10.0.0.1")]);
        let mut tracker = DebounceTracker::new(Duration::from_secs(60));

        observe(&mut store, &mut tracker, false, 0);
        let state = store.get("10.0.0.1").unwrap();
        assert_eq!(state.reachable, None);
        assert_eq!(state.phase, Phase::DownPending);
    }

    #[test]
    fn test_readers_see_published_snapshot_only() {
        let mut store = HostStateStore::new(&[Target::new("web1", "10.0.0.1")]);
        let mut tracker = DebounceTracker::new(Duration::from_secs(5));
        let reader = store.subscribe();

        observe(&mut store, &mut tracker, true, 0);
        assert_eq!(reader.borrow()[0].reachable, None);

        store.publish();
        assert_eq!(reader.borrow()[0].reachable, Some(true));
    }
}
