//! Polling scheduler: probes every target on a fixed tick, debounces the
//! results, dispatches alerts, records history, and sends the daily digest.

use crate::config::Config;
use crate::debounce::{AlertEvent, DebounceTracker, Phase};
use crate::history::{ProbeRecord, TimeSeriesStore};
use crate::notifier::{self, Notifier};
use crate::probe::{Probe, ProbeOutcome};
use crate::state::HostStateStore;
use crate::status::StatusReader;
use crate::targets::Target;

use chrono::{DateTime, Days, NaiveTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Slack on top of the probe timeout before a probe is abandoned
const PROBE_DEADLINE_SLACK: Duration = Duration::from_secs(1);

/// An alert raised during a poll cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub target: Target,
    pub event: AlertEvent,
    pub message: String,
}

pub struct Engine {
    config: Config,
    targets: Vec<Target>,
    prober: Arc<dyn Probe>,
    states: HostStateStore,
    tracker: DebounceTracker,
    store: Arc<TimeSeriesStore>,
    notifier: Notifier,
    cycles: u64,
}

impl Engine {
    pub fn new(
        config: Config,
        targets: Vec<Target>,
        prober: Arc<dyn Probe>,
        store: Arc<TimeSeriesStore>,
        notifier: Notifier,
    ) -> Self {
        let states = HostStateStore::new(&targets);
        let tracker = DebounceTracker::new(config.grace_period);

        Self {
            config,
            targets,
            prober,
            states,
            tracker,
            store,
            notifier,
            cycles: 0,
        }
    }

    /// Read handle for the status surface; stays valid while the engine runs
    pub fn reader(&self) -> StatusReader {
        StatusReader::new(
            self.states.subscribe(),
            Arc::clone(&self.store),
            self.config.uptime_window,
        )
    }

    pub fn states(&self) -> &HostStateStore {
        &self.states
    }

    pub fn tracker(&self) -> &DebounceTracker {
        &self.tracker
    }

    /// Run poll cycles until the process ends
    #[instrument(skip(self), fields(targets = self.targets.len()))]
    pub async fn run(mut self) {
        info!(
            "Monitoring {} targets every {:?} (grace period {:?}, policy {})",
            self.targets.len(),
            self.config.poll_interval,
            self.config.grace_period,
            self.config.reachability_policy
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut report = interval(Duration::from_secs(60));
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let digest_enabled = self.config.digest_enabled;
        let mut next_digest = next_digest_after(Utc::now(), self.config.digest_hour_utc);
        let mut digest_deadline = deadline_for(next_digest);
        if digest_enabled {
            info!("Next digest scheduled for {}", next_digest);
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = sleep_until(digest_deadline), if digest_enabled => {
                    self.send_digest();
                    next_digest = next_digest_after(next_digest, self.config.digest_hour_utc);
                    digest_deadline = deadline_for(next_digest);
                    debug!("Next digest scheduled for {}", next_digest);
                }
                _ = report.tick() => {
                    self.report_metrics().await;
                }
            }
        }
    }

    /// One poll cycle stamped with the current time
    pub async fn poll_once(&mut self) -> Vec<Dispatched> {
        self.poll_at(Utc::now()).await
    }

    /// Probe every target concurrently, then apply the outcomes host by host
    /// as if observed at `now`
    pub async fn poll_at(&mut self, now: DateTime<Utc>) -> Vec<Dispatched> {
        let outcomes = self.probe_all().await;
        let mut dispatched = Vec::new();

        for (index, outcome) in outcomes.into_iter().enumerate() {
            if let Some(alert) = self.apply(index, outcome, now).await {
                dispatched.push(alert);
            }
        }

        self.states.publish();
        self.cycles += 1;
        debug!("Poll cycle {} finished, {} alerts", self.cycles, dispatched.len());

        dispatched
    }

    async fn probe_all(&self) -> Vec<ProbeOutcome> {
        let deadline = self.config.probe_timeout + PROBE_DEADLINE_SLACK;
        let prober = Arc::clone(&self.prober);
        let addresses: Vec<String> = self
            .targets
            .iter()
            .map(|target| target.address.clone())
            .collect();

        let mut outcomes: Vec<(usize, ProbeOutcome)> = stream::iter(addresses.into_iter().enumerate())
            .map(move |(index, address)| {
                let prober = Arc::clone(&prober);
                async move {
                    let outcome = match timeout(deadline, prober.probe(&address)).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!("Probe of {} overran {:?}, counting as down", address, deadline);
                            ProbeOutcome::down()
                        }
                    };
                    (index, outcome)
                }
            })
            .buffer_unordered(self.config.max_concurrent_probes)
            .collect()
            .await;

        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    async fn apply(
        &mut self,
        index: usize,
        outcome: ProbeOutcome,
        now: DateTime<Utc>,
    ) -> Option<Dispatched> {
        let target = &self.targets[index];
        let decision = self.tracker.observe(&target.address, outcome.reachable, now);
        self.states.apply(&target.address, &outcome, &decision, now);

        if decision.from != decision.to {
            debug!(
                "{} ({}) {} -> {}",
                target.hostname, target.address, decision.from, decision.to
            );
        }

        let dispatched = decision.event.map(|event| {
            let message = match event {
                AlertEvent::Down(episode) => {
                    warn!(
                        episode = %episode.id,
                        "{} ({}) confirmed DOWN, failing since {}",
                        target.hostname, target.address, episode.since
                    );
                    notifier::alert_message(target, self.tracker.grace_period())
                }
                AlertEvent::Recovery(episode) => {
                    info!(
                        episode = %episode.id,
                        "{} ({}) recovered",
                        target.hostname, target.address
                    );
                    notifier::recovery_message(target, now - episode.since)
                }
            };

            self.notifier.notify(message.clone());
            Dispatched {
                target: target.clone(),
                event,
                message,
            }
        });

        self.store
            .append(ProbeRecord::new(target, &outcome, now))
            .await;

        dispatched
    }

    /// Targets currently confirmed down, with their down-since time
    pub fn down_hosts(&self) -> Vec<(Target, Option<DateTime<Utc>>)> {
        self.targets
            .iter()
            .filter(|target| self.tracker.phase(&target.address) == Phase::DownConfirmed)
            .map(|target| {
                let since = self
                    .tracker
                    .entry(&target.address)
                    .and_then(|entry| entry.down_since());
                (target.clone(), since)
            })
            .collect()
    }

    pub fn digest(&self) -> String {
        notifier::digest_message(&self.down_hosts())
    }

    /// Queue the digest; sent even when every host is up
    pub fn send_digest(&self) {
        let message = self.digest();
        info!("Sending daily digest ({} hosts down)", self.down_hosts().len());
        self.notifier.notify(message);
    }

    async fn report_metrics(&self) {
        let delivery = self.notifier.metrics().await;
        let down = self
            .states
            .iter()
            .filter(|state| state.reachable == Some(false))
            .count();

        info!(
            "Monitor metrics - {} cycles, {}/{} hosts down, notifications: {} attempted, {} delivered, {} failed, {} dropped",
            self.cycles,
            down,
            self.targets.len(),
            delivery.attempts,
            delivery.successes,
            delivery.failures,
            delivery.dropped
        );
    }
}

/// Monotonic deadline for a wall-clock instant; past instants are due now
fn deadline_for(at: DateTime<Utc>) -> Instant {
    Instant::now() + (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// First `hour:00 UTC` strictly after `after`
pub fn next_digest_after(after: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let today = after.date_naive().and_time(at).and_utc();

    if today > after {
        today
    } else {
        today
            .checked_add_days(Days::new(1))
            .unwrap_or(today + TimeDelta::days(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::AlertSink;
    use async_trait::async_trait;
    use chrono::{TimeZone, Timelike};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::sleep;

    /// Probe whose answers are set by the test
    #[derive(Default)]
    struct ScriptedProbe {
        reachable: Mutex<HashMap<String, bool>>,
    }

    impl ScriptedProbe {
        fn set(&self, address: &str, reachable: bool) {
            self.reachable
                .lock()
                .unwrap()
                .insert(address.to_string(), reachable);
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, address: &str) -> ProbeOutcome {
            match self.reachable.lock().unwrap().get(address) {
                Some(true) => ProbeOutcome::up(Some(2.5)),
                _ => ProbeOutcome::down(),
            }
        }
    }

    struct Hanging;

    #[async_trait]
    impl Probe for Hanging {
        async fn probe(&self, _address: &str) -> ProbeOutcome {
            sleep(Duration::from_secs(3600)).await;
            ProbeOutcome::up(None)
        }
    }

    /// Sink that keeps every delivered message
    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, message: &str) -> crate::errors::Result<()> {
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn engine_with(targets: &[(&str, &str)], grace_secs: u64) -> (Engine, Arc<ScriptedProbe>) {
        let config = Config {
            grace_period: Duration::from_secs(grace_secs),
            poll_interval: Duration::from_secs(1),
            ..Config::default()
        };
        let targets = targets
            .iter()
            .map(|(hostname, address)| Target::new(*hostname, *address))
            .collect();
        let probe = Arc::new(ScriptedProbe::default());
        let engine = Engine::new(
            config,
            targets,
            probe.clone(),
            Arc::new(TimeSeriesStore::in_memory(100)),
            Notifier::disabled(),
        );
        (engine, probe)
    }

    #[tokio::test]
    async fn test_web1_scenario() {
        let (mut engine, probe) = engine_with(&[("web1", "10.0.0.1")], 5);

        probe.set("10.0.0.1", false);
        for t in 0..5 {
            let alerts = engine.poll_at(at(t)).await;
            assert!(alerts.is_empty(), "no alert expected at t={}", t);
            assert_eq!(engine.tracker().phase("10.0.0.1"), Phase::DownPending);
        }
        assert_eq!(
            engine.tracker().entry("10.0.0.1").unwrap().down_since(),
            Some(at(0))
        );

        let alerts = engine.poll_at(at(5)).await;
        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0].event, AlertEvent::Down(_)));
        assert_eq!(alerts[0].message, "ALERT: web1 (10.0.0.1) has been DOWN for 5s");
        assert_eq!(engine.tracker().phase("10.0.0.1"), Phase::DownConfirmed);

        probe.set("10.0.0.1", true);
        let alerts = engine.poll_at(at(6)).await;
        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0].event, AlertEvent::Recovery(_)));
        assert_eq!(alerts[0].message, "RECOVERY: web1 (10.0.0.1) is back UP after 6s");

        let entry = engine.tracker().entry("10.0.0.1").unwrap();
        assert!(!entry.alert_sent);
        assert_eq!(engine.tracker().phase("10.0.0.1"), Phase::Up);
    }

    #[tokio::test]
    async fn test_one_alert_per_episode() {
        let (mut engine, probe) = engine_with(&[("db1", "10.0.0.2")], 2);
        probe.set("10.0.0.2", false);

        let mut alerts = 0;
        for t in 0..30 {
            alerts += engine.poll_at(at(t)).await.len();
        }
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_up_host_is_idempotent() {
        let (mut engine, probe) = engine_with(&[("web1", "10.0.0.1")], 5);
        probe.set("10.0.0.1", true);

        for t in 0..10 {
            assert!(engine.poll_at(at(t)).await.is_empty());
        }

        let state = engine.states().get("10.0.0.1").unwrap();
        assert_eq!(state.reachable, Some(true));
        assert!(state.last_change.is_none());
        assert_eq!(state.latency_ms, Some(2.5));
    }

    #[tokio::test]
    async fn test_hosts_are_independent() {
        let (mut engine, probe) =
            engine_with(&[("web1", "10.0.0.1"), ("web2", "10.0.0.2")], 1);
        probe.set("10.0.0.1", true);
        probe.set("10.0.0.2", false);

        engine.poll_at(at(0)).await;
        let alerts = engine.poll_at(at(1)).await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].target.hostname, "web2");
        assert_eq!(engine.tracker().phase("10.0.0.1"), Phase::Up);
    }

    #[tokio::test]
    async fn test_every_poll_is_recorded() {
        let (mut engine, probe) = engine_with(&[("web1", "10.0.0.1")], 5);
        let reader = engine.reader();

        probe.set("10.0.0.1", true);
        engine.poll_at(at(0)).await;
        probe.set("10.0.0.1", false);
        engine.poll_at(at(1)).await;

        let history = reader.history("10.0.0.1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].reachable);
        assert_eq!(history[1].latency_ms, 0.0);

        let status = reader.status().await;
        assert_eq!(status[0].reachable, Some(true));
        assert_eq!(status[0].phase, Phase::DownPending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_counts_as_down() {
        let config = Config {
            probe_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        let mut engine = Engine::new(
            config,
            vec![Target::new("slow", "10.0.0.9")],
            Arc::new(Hanging),
            Arc::new(TimeSeriesStore::in_memory(10)),
            Notifier::disabled(),
        );

        engine.poll_at(at(0)).await;
        assert_eq!(engine.tracker().phase("10.0.0.9"), Phase::DownPending);
    }

    #[tokio::test]
    async fn test_digest_lists_confirmed_down_hosts_only() {
        let (mut engine, probe) = engine_with(
            &[("web1", "10.0.0.1"), ("db1", "10.0.0.2"), ("mail", "10.0.0.3")],
            1,
        );
        assert_eq!(engine.digest(), "Daily summary: all hosts are UP");

        probe.set("10.0.0.1", true);
        engine.poll_at(at(0)).await;
        engine.poll_at(at(1)).await;
        probe.set("10.0.0.3", true);
        engine.poll_at(at(2)).await;

        let down = engine.down_hosts();
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].0.hostname, "db1");
        assert_eq!(down[0].1, Some(at(0)));
        assert!(engine.digest().starts_with("Daily summary: 1 host(s) DOWN"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_run_polls_and_sends_digest() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config {
            grace_period: Duration::ZERO,
            poll_interval: Duration::from_secs(600),
            digest_hour_utc: (Utc::now().hour() + 2) % 24,
            ..Config::default()
        };
        let engine = Engine::new(
            config,
            vec![Target::new("web1", "10.0.0.1")],
            Arc::new(ScriptedProbe::default()),
            Arc::new(TimeSeriesStore::in_memory(100)),
            Notifier::spawn(Some(sink.clone() as Arc<dyn AlertSink>)),
        );
        let reader = engine.reader();
        let handle = tokio::spawn(engine.run());

        for _ in 0..300 {
            if sink.messages().iter().any(|m| m.starts_with("Daily summary")) {
                break;
            }
            sleep(Duration::from_secs(60)).await;
        }
        handle.abort();

        let messages = sink.messages();
        assert!(
            messages[0].starts_with("ALERT: web1 (10.0.0.1) has been DOWN"),
            "unexpected first message {:?}",
            messages
        );
        let digest = messages
            .iter()
            .find(|m| m.starts_with("Daily summary"))
            .expect("digest was not delivered");
        assert!(digest.starts_with("Daily summary: 1 host(s) DOWN"));
        assert!(digest.contains("- web1 (10.0.0.1) down since"));

        let status = reader.status().await;
        assert_eq!(status[0].reachable, Some(false));
        assert!(reader.history("10.0.0.1", 100).await.unwrap().len() >= 2);
    }

    #[test]
    fn test_next_digest_after() {
        let morning = Utc.with_ymd_and_hms(2024, 3, 1, 7, 15, 0).unwrap();
        assert_eq!(
            next_digest_after(morning, 9),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
        );

        let exactly = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(
            next_digest_after(exactly, 9),
            Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap()
        );

        let evening = Utc.with_ymd_and_hms(2024, 12, 31, 22, 0, 0).unwrap();
        assert_eq!(
            next_digest_after(evening, 0),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }
}
