//! Target list loading

use crate::errors::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// A monitored host. Immutable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Display label
    pub hostname: String,
    /// IP address or resolvable name that gets probed
    pub address: String,
}

impl Target {
    pub fn new(hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
        }
    }
}

/// Parse `hostname,address` lines.
///
/// Blank lines and lines without a comma are skipped, as are lines whose
/// hostname or address is empty after trimming. Only the first comma
/// separates the fields.
pub fn parse_targets(contents: &str) -> Result<Vec<Target>> {
    let mut targets = Vec::new();
    let mut seen = HashSet::new();

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        let Some((hostname, address)) = line.split_once(',') else {
            if !line.is_empty() {
                debug!("Skipping target line {} without a comma", index + 1);
            }
            continue;
        };

        let (hostname, address) = (hostname.trim(), address.trim());
        if hostname.is_empty() || address.is_empty() {
            debug!("Skipping incomplete target line {}", index + 1);
            continue;
        }

        if !seen.insert(address.to_string()) {
            return Err(MonitorError::Config(format!(
                "duplicate target address '{}' on line {}",
                address,
                index + 1
            )));
        }

        targets.push(Target::new(hostname, address));
    }

    if targets.is_empty() {
        return Err(MonitorError::Config(
            "target list contains no hosts".to_string(),
        ));
    }

    Ok(targets)
}

/// Read and parse the target list file
pub async fn load_targets(path: impl AsRef<Path>) -> Result<Vec<Target>> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        MonitorError::Config(format!("cannot read target list {}: {}", path.display(), e))
    })?;

    let targets = parse_targets(&contents)?;
    info!("Loaded {} targets from {}", targets.len(), path.display());
    Ok(targets)
}
