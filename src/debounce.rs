//! Grace-period debouncing of host state transitions
//!
//! Every poll feeds one observation per host into [`DebounceTracker::observe`].
//! A host only counts as down once it has failed continuously for the grace
//! period; recovery is reported on the first successful probe.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Debounce phase of a single host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Unknown,
    Up,
    DownPending,
    DownConfirmed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Unknown => write!(f, "UNKNOWN"),
            Phase::Up => write!(f, "UP"),
            Phase::DownPending => write!(f, "DOWN_PENDING"),
            Phase::DownConfirmed => write!(f, "DOWN_CONFIRMED"),
        }
    }
}

/// One unresolved down period of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DebounceEntry {
    pub phase: Phase,
    /// Set while the host is failing; its `since` is the down-since time
    pub episode: Option<Episode>,
    /// A DOWN alert went out for the current episode
    pub alert_sent: bool,
}

impl DebounceEntry {
    pub fn down_since(&self) -> Option<DateTime<Utc>> {
        self.episode.map(|episode| episode.since)
    }
}

/// Notification-worthy outcome of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    /// Grace period elapsed, the host is confirmed down
    Down(Episode),
    /// Host answered again after a DOWN alert was sent
    Recovery(Episode),
}

/// What a single observation did to a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub from: Phase,
    pub to: Phase,
    pub event: Option<AlertEvent>,
}

impl Decision {
    /// True when this poll confirmed a down or brought a failing host back up
    pub fn is_confirmed_change(&self) -> bool {
        matches!(
            (self.from, self.to),
            (Phase::DownPending, Phase::DownConfirmed)
                | (Phase::DownPending, Phase::Up)
                | (Phase::DownConfirmed, Phase::Up)
        )
    }
}

#[derive(Debug)]
pub struct DebounceTracker {
    entries: HashMap<String, DebounceEntry>,
    grace_period: TimeDelta,
}

impl DebounceTracker {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            grace_period: TimeDelta::from_std(grace_period).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Feed one probe result for `address` observed at `now`
    pub fn observe(&mut self, address: &str, reachable: bool, now: DateTime<Utc>) -> Decision {
        let grace_period = self.grace_period;
        let entry = self.entries.entry(address.to_string()).or_default();
        let from = entry.phase;

        let event = if reachable {
            let episode = entry.episode.take();
            let alerted = std::mem::replace(&mut entry.alert_sent, false);
            entry.phase = Phase::Up;

            match (from, alerted, episode) {
                (Phase::DownConfirmed | Phase::DownPending, true, Some(episode)) => {
                    Some(AlertEvent::Recovery(episode))
                }
                _ => None,
            }
        } else {
            match from {
                Phase::Unknown | Phase::Up => {
                    entry.episode = Some(Episode {
                        id: Uuid::new_v4(),
                        since: now,
                    });
                    entry.phase = Phase::DownPending;
                    None
                }
                Phase::DownPending => {
                    let episode = *entry.episode.get_or_insert(Episode {
                        id: Uuid::new_v4(),
                        since: now,
                    });

                    if now - episode.since >= grace_period && !entry.alert_sent {
                        entry.phase = Phase::DownConfirmed;
                        entry.alert_sent = true;
                        Some(AlertEvent::Down(episode))
                    } else {
                        None
                    }
                }
                Phase::DownConfirmed => None,
            }
        };

        Decision {
            from,
            to: entry.phase,
            event,
        }
    }

    pub fn entry(&self, address: &str) -> Option<&DebounceEntry> {
        self.entries.get(address)
    }

    pub fn phase(&self, address: &str) -> Phase {
        self.entries
            .get(address)
            .map(|entry| entry.phase)
            .unwrap_or_default()
    }

    pub fn grace_period(&self) -> TimeDelta {
        self.grace_period
    }
}
