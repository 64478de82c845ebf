//! Probe history: bounded in-memory time series with an optional
//! JSON-lines append log

use crate::errors::Result;
use crate::probe::ProbeOutcome;
use crate::targets::Target;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// One probe of one host
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub address: String,
    pub hostname: String,
    pub reachable: bool,
    /// Milliseconds, 0 when the host did not answer
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl ProbeRecord {
    pub fn new(target: &Target, outcome: &ProbeOutcome, timestamp: DateTime<Utc>) -> Self {
        Self {
            address: target.address.clone(),
            hostname: target.hostname.clone(),
            reachable: outcome.reachable,
            latency_ms: outcome.latency_ms.unwrap_or(0.0),
            timestamp,
        }
    }
}

/// Aggregates over the records of one host inside a time window
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WindowStats {
    pub samples: usize,
    pub reachable: usize,
    /// Percentage rounded to two decimals, 100.0 without samples
    pub uptime_ratio: f64,
    /// Mean latency of the reachable samples
    pub avg_latency_ms: Option<f64>,
}

#[derive(Debug)]
struct HistoryLog {
    path: PathBuf,
    file: File,
}

/// Append-only probe history.
///
/// The engine is the only writer; status readers take the read lock.
#[derive(Debug)]
pub struct TimeSeriesStore {
    series: RwLock<HashMap<String, VecDeque<ProbeRecord>>>,
    capacity: usize,
    log: Option<Mutex<HistoryLog>>,
}

impl TimeSeriesStore {
    /// Store that keeps at most `capacity` records per host in memory
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            log: None,
        }
    }

    /// Store mirrored to a JSON-lines file.
    ///
    /// Existing records in the file seed the in-memory window, so uptime
    /// figures survive a restart. The file is read line by line; lines that
    /// are not valid UTF-8 or not a valid record are skipped.
    pub async fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::in_memory(capacity);

        match File::open(&path).await {
            Ok(file) => {
                let loaded = store.seed(BufReader::new(file)).await;
                info!("Loaded {} history records from {}", loaded, path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("History file {} does not exist yet", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        store.log = Some(Mutex::new(HistoryLog { path, file }));
        Ok(store)
    }

    async fn seed<R>(&mut self, reader: R) -> usize
    where
        R: AsyncBufRead + Unpin,
    {
        let capacity = self.capacity;
        let series = self.series.get_mut();
        let mut lines = reader.split(b'\n');
        let mut line_number = 0;
        let mut loaded = 0;

        loop {
            let raw = match lines.next_segment().await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    warn!("Stopped reading history after line {}: {}", line_number, e);
                    break;
                }
            };
            line_number += 1;

            let Ok(line) = std::str::from_utf8(&raw) else {
                warn!("Skipping history line {}: not valid UTF-8", line_number);
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProbeRecord>(line) {
                Ok(record) => {
                    push_bounded(series, record, capacity);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping malformed history line {}: {}", line_number, e),
            }
        }

        loaded
    }

    /// Record a probe result.
    ///
    /// The in-memory window always receives the record. A failed file write
    /// is logged and the record stays in memory only.
    pub async fn append(&self, record: ProbeRecord) {
        let line = match &self.log {
            Some(_) => match serde_json::to_string(&record) {
                Ok(line) => Some(line),
                Err(e) => {
                    error!("Failed to serialize probe record for {}: {}", record.address, e);
                    None
                }
            },
            None => None,
        };

        {
            let mut series = self.series.write().await;
            push_bounded(&mut series, record, self.capacity);
        }

        if let (Some(log), Some(line)) = (&self.log, line) {
            let mut log = log.lock().await;
            if let Err(e) = write_line(&mut log.file, &line).await {
                error!("Failed to append to history file {}: {}", log.path.display(), e);
            }
        }
    }

    /// The most recent `limit` records of a host, oldest first
    pub async fn recent_history(&self, address: &str, limit: usize) -> Vec<ProbeRecord> {
        let series = self.series.read().await;
        match series.get(address) {
            Some(records) => {
                let skip = records.len().saturating_sub(limit);
                records.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Uptime percentage of a host over the trailing `window`
    pub async fn uptime_ratio(&self, address: &str, window: Duration) -> f64 {
        self.window_stats_at(address, window, Utc::now())
            .await
            .uptime_ratio
    }

    pub async fn window_stats(&self, address: &str, window: Duration) -> WindowStats {
        self.window_stats_at(address, window, Utc::now()).await
    }

    /// Aggregate the records with `timestamp >= now - window`
    pub async fn window_stats_at(
        &self,
        address: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> WindowStats {
        let cutoff = TimeDelta::from_std(window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let series = self.series.read().await;

        let mut samples = 0;
        let mut reachable = 0;
        let mut latency_total = 0.0;

        if let Some(records) = series.get(address) {
            for record in records.iter().filter(|r| r.timestamp >= cutoff) {
                samples += 1;
                if record.reachable {
                    reachable += 1;
                    latency_total += record.latency_ms;
                }
            }
        }

        WindowStats {
            samples,
            reachable,
            uptime_ratio: uptime_percentage(reachable, samples),
            avg_latency_ms: (reachable > 0).then(|| latency_total / reachable as f64),
        }
    }

    /// Number of records currently held for a host
    pub async fn len(&self, address: &str) -> usize {
        self.series
            .read()
            .await
            .get(address)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

fn push_bounded(
    series: &mut HashMap<String, VecDeque<ProbeRecord>>,
    record: ProbeRecord,
    capacity: usize,
) {
    let records = series.entry(record.address.clone()).or_default();
    if records.len() >= capacity {
        records.pop_front();
    }
    records.push_back(record);
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

/// `100 * up / total` rounded to two decimals; no samples means 100.0
pub fn uptime_percentage(up: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let ratio = 100.0 * up as f64 / total as f64;
    (ratio * 100.0).round() / 100.0
}
