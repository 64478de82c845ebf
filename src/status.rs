//! Read-only status accessors for the dashboard and the JSON feed

use crate::debounce::Phase;
use crate::history::{ProbeRecord, TimeSeriesStore};
use crate::state::{HostState, StateSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One row of the status feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostStatus {
    pub hostname: String,
    pub address: String,
    pub reachable: Option<bool>,
    pub phase: Phase,
    pub latency_ms: Option<f64>,
    /// Timestamp of the last confirmed transition, or "Never"
    pub last_change: String,
    pub last_checked: Option<DateTime<Utc>>,
    pub uptime_ratio: f64,
    pub avg_latency_ms: Option<f64>,
}

/// Cheap-to-clone handle over engine snapshots and probe history
#[derive(Debug, Clone)]
pub struct StatusReader {
    states: watch::Receiver<StateSnapshot>,
    store: Arc<TimeSeriesStore>,
    uptime_window: Duration,
}

impl StatusReader {
    pub fn new(
        states: watch::Receiver<StateSnapshot>,
        store: Arc<TimeSeriesStore>,
        uptime_window: Duration,
    ) -> Self {
        Self {
            states,
            store,
            uptime_window,
        }
    }

    /// Latest published host states, unsorted
    pub fn snapshot(&self) -> StateSnapshot {
        Arc::clone(&*self.states.borrow())
    }

    pub fn uptime_window(&self) -> Duration {
        self.uptime_window
    }

    /// Every host with its windowed uptime, unreachable hosts first, then by
    /// hostname
    pub async fn status(&self) -> Vec<HostStatus> {
        let snapshot = self.snapshot();
        let mut rows = Vec::with_capacity(snapshot.len());

        for state in snapshot.iter() {
            let stats = self
                .store
                .window_stats(&state.address, self.uptime_window)
                .await;
            rows.push(to_status(state, stats.uptime_ratio, stats.avg_latency_ms));
        }

        sort_for_display(&mut rows);
        rows
    }

    /// Recent probe records of a monitored host, oldest first.
    ///
    /// Returns `None` when the address is not a monitored target.
    pub async fn history(&self, address: &str, limit: usize) -> Option<Vec<ProbeRecord>> {
        let known = self.snapshot().iter().any(|s| s.address == address);
        if !known {
            return None;
        }
        Some(self.store.recent_history(address, limit).await)
    }
}

fn to_status(state: &HostState, uptime_ratio: f64, avg_latency_ms: Option<f64>) -> HostStatus {
    HostStatus {
        hostname: state.hostname.clone(),
        address: state.address.clone(),
        reachable: state.reachable,
        phase: state.phase,
        latency_ms: state.latency_ms,
        last_change: state
            .last_change
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "Never".to_string()),
        last_checked: state.last_checked,
        uptime_ratio,
        avg_latency_ms,
    }
}

pub fn sort_for_display(rows: &mut [HostStatus]) {
    rows.sort_by(|a, b| {
        let a_up = a.reachable != Some(false);
        let b_up = b.reachable != Some(false);
        a_up.cmp(&b_up).then_with(|| a.hostname.cmp(&b.hostname))
    });
}
