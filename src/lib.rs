//! Host liveness monitor
//!
//! Probes a fixed set of hosts on a fixed tick, debounces up/down transitions
//! behind a grace period, sends webhook alerts on confirmed transitions,
//! keeps a bounded probe history, and exposes a status feed and dashboard.

pub mod config;
pub mod debounce;
pub mod engine;
pub mod errors;
pub mod history;
pub mod notifier;
pub mod probe;
pub mod server;
pub mod state;
pub mod status;
pub mod targets;

pub use config::{Config, ReachabilityPolicy};
pub use debounce::{AlertEvent, DebounceTracker, Phase};
pub use engine::Engine;
pub use errors::{MonitorError, Result};
pub use history::{ProbeRecord, TimeSeriesStore};
pub use notifier::{AlertSink, Notifier, WebhookSink};
pub use probe::{Probe, ProbeOutcome, SystemProber};
pub use status::{HostStatus, StatusReader};
pub use targets::Target;
