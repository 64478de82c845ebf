//! Configuration management for the host monitor

use crate::errors::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How the ping check and the optional TCP port check combine into a
/// single reachability verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReachabilityPolicy {
    /// Reachable if either check succeeds
    Any,
    /// Reachable only if both checks succeed
    All,
    /// TCP ports are ignored
    Ping,
}

impl fmt::Display for ReachabilityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReachabilityPolicy::Any => write!(f, "any"),
            ReachabilityPolicy::All => write!(f, "all"),
            ReachabilityPolicy::Ping => write!(f, "ping"),
        }
    }
}

impl FromStr for ReachabilityPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "any" | "or" => Ok(ReachabilityPolicy::Any),
            "all" | "and" => Ok(ReachabilityPolicy::All),
            "ping" | "ping-only" => Ok(ReachabilityPolicy::Ping),
            other => Err(format!("unknown reachability policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Webhook that receives alert text; `None` disables notifications
    pub sink_url: Option<String>,

    /// Time between two poll cycles
    pub poll_interval: Duration,

    /// Echo requests sent per ping check
    pub probe_count: u32,

    /// Upper bound for a single probe of one host
    pub probe_timeout: Duration,

    /// Sustained-down duration before a DOWN alert is sent
    pub grace_period: Duration,

    /// Hour of day (UTC) at which the digest goes out
    pub digest_hour_utc: u32,

    /// Send the daily digest at all
    pub digest_enabled: bool,

    /// Auto-refresh period of the HTML dashboard
    pub dashboard_refresh: Duration,

    /// Ports for the secondary TCP reachability check
    pub tcp_ports: Vec<u16>,

    /// How ping and TCP results combine
    pub reachability_policy: ReachabilityPolicy,

    /// Window used for the uptime ratio in the status feed
    pub uptime_window: Duration,

    /// Minimum probe records kept in memory per host
    pub history_capacity: usize,

    /// Optional JSON-lines file mirroring the probe history
    pub history_file: Option<PathBuf>,

    /// Upper bound on probes in flight during one cycle
    pub max_concurrent_probes: usize,

    /// HTTP timeout for webhook requests
    pub notify_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sink_url: None,
            poll_interval: Duration::from_secs(5),
            probe_count: 2,
            probe_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(300),
            digest_hour_utc: 9,
            digest_enabled: true,
            dashboard_refresh: Duration::from_secs(10),
            tcp_ports: Vec::new(),
            reachability_policy: ReachabilityPolicy::Any,
            uptime_window: Duration::from_secs(60 * 60),
            history_capacity: 1440,
            history_file: None,
            max_concurrent_probes: 32,
            notify_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults. A key that is set but cannot be
    /// parsed is a configuration error rather than a silent fallback.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup("WEBHOOK_URL") {
            let url = url.trim().to_string();
            if !url.is_empty() {
                config.sink_url = Some(url);
            }
        }

        if let Some(seconds) = parse_var::<u64, _>(&lookup, "POLL_INTERVAL_SECONDS")? {
            config.poll_interval = Duration::from_secs(seconds);
        }

        if let Some(count) = parse_var(&lookup, "PING_COUNT")? {
            config.probe_count = count;
        }

        if let Some(seconds) = parse_var::<u64, _>(&lookup, "PROBE_TIMEOUT_SECONDS")? {
            config.probe_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = parse_var::<u64, _>(&lookup, "GRACE_PERIOD")? {
            config.grace_period = Duration::from_secs(seconds);
        }

        if let Some(hour) = parse_var(&lookup, "DAILY_HOUR_UTC")? {
            config.digest_hour_utc = hour;
        }

        if let Some(enabled) = lookup("DIGEST_ENABLED") {
            config.digest_enabled = parse_bool("DIGEST_ENABLED", &enabled)?;
        }

        if let Some(seconds) = parse_var::<u64, _>(&lookup, "DASHBOARD_REFRESH_SECONDS")? {
            config.dashboard_refresh = Duration::from_secs(seconds);
        }

        if let Some(ports) = lookup("TCP_PORTS") {
            config.tcp_ports = parse_ports(&ports)?;
        }

        if let Some(policy) = lookup("REACHABILITY_POLICY") {
            config.reachability_policy = policy
                .parse()
                .map_err(|e| MonitorError::Config(format!("REACHABILITY_POLICY: {}", e)))?;
        }

        if let Some(minutes) = parse_var::<u64, _>(&lookup, "UPTIME_WINDOW_MINUTES")? {
            config.uptime_window = Duration::from_secs(minutes * 60);
        }

        if let Some(capacity) = parse_var(&lookup, "HISTORY_CAPACITY")? {
            config.history_capacity = capacity;
        }

        if let Some(path) = lookup("HISTORY_FILE") {
            if !path.trim().is_empty() {
                config.history_file = Some(PathBuf::from(path.trim()));
            }
        }

        if let Some(limit) = parse_var(&lookup, "MAX_CONCURRENT_PROBES")? {
            config.max_concurrent_probes = limit;
        }

        if let Some(seconds) = parse_var::<u64, _>(&lookup, "NOTIFY_TIMEOUT_SECONDS")? {
            config.notify_timeout = Duration::from_secs(seconds);
        }

        Ok(config)
    }

    /// Records kept per host: `history_capacity`, raised when needed so the
    /// whole uptime window fits at the configured poll interval
    pub fn effective_history_capacity(&self) -> usize {
        let poll_secs = self.poll_interval.as_secs().max(1);
        let needed = self.uptime_window.as_secs().div_ceil(poll_secs);
        self.history_capacity
            .max(usize::try_from(needed).unwrap_or(usize::MAX))
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        let poll_secs = self.poll_interval.as_secs();
        if !(1..=3600).contains(&poll_secs) {
            return Err(format!(
                "poll interval must be between 1 and 3600 seconds, got {}",
                poll_secs
            ));
        }

        if self.probe_count == 0 {
            return Err("probe_count must be greater than 0".to_string());
        }

        if self.probe_timeout.is_zero() {
            return Err("probe_timeout must be at least 1 second".to_string());
        }

        if self.digest_hour_utc > 23 {
            return Err(format!(
                "digest hour must be between 0 and 23, got {}",
                self.digest_hour_utc
            ));
        }

        if self.dashboard_refresh.is_zero() {
            return Err("dashboard refresh must be at least 1 second".to_string());
        }

        if self.uptime_window.is_zero() {
            return Err("uptime window must be at least 1 minute".to_string());
        }

        if self.history_capacity == 0 {
            return Err("history_capacity must be greater than 0".to_string());
        }

        if self.max_concurrent_probes == 0 {
            return Err("max_concurrent_probes must be greater than 0".to_string());
        }

        if let Some(url) = &self.sink_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("WEBHOOK_URL must be an http(s) URL, got '{}'", url));
            }
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            MonitorError::Config(format!("{} has an invalid value '{}'", key, raw))
        }),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(MonitorError::Config(format!(
            "{} must be true or false, got '{}'",
            key, raw
        ))),
    }
}

fn parse_ports(raw: &str) -> Result<Vec<u16>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| MonitorError::Config(format!("TCP_PORTS has an invalid port '{}'", s)))
        })
        .collect()
}
