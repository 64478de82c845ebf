//! Reachability probes: system ping plus an optional TCP port check

use crate::config::{Config, ReachabilityPolicy};
use async_trait::async_trait;
use futures::future::{select_ok, BoxFuture, FutureExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Result of probing one host once
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub reachable: bool,
    /// Round-trip time in milliseconds, absent when the host did not answer
    pub latency_ms: Option<f64>,
}

impl ProbeOutcome {
    pub fn up(latency_ms: Option<f64>) -> Self {
        Self {
            reachable: true,
            latency_ms,
        }
    }

    pub fn down() -> Self {
        Self {
            reachable: false,
            latency_ms: None,
        }
    }
}

/// A single liveness check against an address.
///
/// Implementations must resolve within a bounded time and must never fail:
/// every network problem is reported as an unreachable outcome.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeOutcome;
}

/// Probe backed by the system `ping` utility and `tokio` TCP connects
#[derive(Debug, Clone)]
pub struct SystemProber {
    count: u32,
    timeout: Duration,
    tcp_ports: Vec<u16>,
    policy: ReachabilityPolicy,
}

impl SystemProber {
    pub fn new(
        count: u32,
        probe_timeout: Duration,
        tcp_ports: Vec<u16>,
        policy: ReachabilityPolicy,
    ) -> Self {
        Self {
            count: count.max(1),
            timeout: probe_timeout,
            tcp_ports,
            policy,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.probe_count,
            config.probe_timeout,
            config.tcp_ports.clone(),
            config.reachability_policy,
        )
    }

    /// Run `ping` under the probe timeout; the child is killed if it overruns
    async fn ping(&self, address: &str) -> ProbeOutcome {
        if address.starts_with('-') {
            warn!("Refusing to ping suspicious address {}", address);
            return ProbeOutcome::down();
        }

        let count_flag = if cfg!(windows) { "-n" } else { "-c" };
        let mut command = Command::new("ping");
        command
            .arg(count_flag)
            .arg(self.count.to_string())
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let started = Instant::now();
        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Failed to run ping for {}: {}", address, e);
                return ProbeOutcome::down();
            }
            Err(_) => {
                debug!("Ping to {} timed out after {:?}", address, self.timeout);
                return ProbeOutcome::down();
            }
        };

        if !output.status.success() {
            debug!("Ping to {} failed with {}", address, output.status);
            return ProbeOutcome::down();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let latency = parse_ping_latency(&stdout).unwrap_or_else(|| {
            started.elapsed().as_secs_f64() * 1000.0 / self.count as f64
        });

        ProbeOutcome::up(Some(latency))
    }

    /// Connect to the configured ports; the first port to accept wins
    async fn tcp_check(&self, address: &str) -> ProbeOutcome {
        if self.tcp_ports.is_empty() {
            return ProbeOutcome::down();
        }

        let attempts: Vec<BoxFuture<'_, std::result::Result<f64, String>>> = self
            .tcp_ports
            .iter()
            .map(|&port| connect_once(address, port, self.timeout).boxed())
            .collect();

        match select_ok(attempts).await {
            Ok((latency, _)) => ProbeOutcome::up(Some(latency)),
            Err(e) => {
                debug!("TCP check for {} failed: {}", address, e);
                ProbeOutcome::down()
            }
        }
    }
}

#[async_trait]
impl Probe for SystemProber {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        if self.tcp_ports.is_empty() || self.policy == ReachabilityPolicy::Ping {
            return self.ping(address).await;
        }

        let (ping, tcp) = tokio::join!(self.ping(address), self.tcp_check(address));
        combine(self.policy, ping, Some(tcp))
    }
}

async fn connect_once(
    address: &str,
    port: u16,
    connect_timeout: Duration,
) -> std::result::Result<f64, String> {
    let started = Instant::now();
    match timeout(connect_timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(_stream)) => Ok(started.elapsed().as_secs_f64() * 1000.0),
        Ok(Err(e)) => Err(format!("port {}: {}", port, e)),
        Err(_) => Err(format!("port {}: connect timed out", port)),
    }
}

/// Merge the ping verdict with the TCP verdict under a policy.
///
/// Latency prefers the ping round-trip and falls back to the TCP connect
/// time. An unreachable verdict never carries a latency.
pub fn combine(
    policy: ReachabilityPolicy,
    ping: ProbeOutcome,
    tcp: Option<ProbeOutcome>,
) -> ProbeOutcome {
    let Some(tcp) = tcp else {
        return ping;
    };

    let reachable = match policy {
        ReachabilityPolicy::Any => ping.reachable || tcp.reachable,
        ReachabilityPolicy::All => ping.reachable && tcp.reachable,
        ReachabilityPolicy::Ping => ping.reachable,
    };

    if !reachable {
        return ProbeOutcome::down();
    }

    let ping_latency = ping.latency_ms.filter(|_| ping.reachable);
    let tcp_latency = tcp.latency_ms.filter(|_| tcp.reachable);
    ProbeOutcome::up(ping_latency.or(tcp_latency))
}

/// Mean of the `time=<x> ms` values in ping output (`time<1ms` counts as 1)
pub fn parse_ping_latency(output: &str) -> Option<f64> {
    static LATENCY: OnceLock<Regex> = OnceLock::new();
    let pattern = LATENCY
        .get_or_init(|| Regex::new(r"time[=<]\s*([0-9]+(?:\.[0-9]+)?)\s*ms").unwrap());

    let samples: Vec<f64> = pattern
        .captures_iter(output)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
        .collect();

    if samples.is_empty() {
        return None;
    }

    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}
