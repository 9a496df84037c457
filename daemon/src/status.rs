use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::registry::{ProcessRegistry, SupervisedProcess};
use crate::video::ShipReport;

/// Runtime status written by the daemon to `<home>/status.toml`.
/// The web front end reads this file (read-only) to render the process table.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub started_at: DateTime<Local>,
    /// Name of the most recently shipped processed video, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_shipped: Option<String>,
    /// RFC 3339 timestamp of the most recent shipping batch, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_shipped_timestamp: Option<String>,
    /// RFC 3339 timestamp of the most recent calibration run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_calibration_timestamp: Option<String>,
    /// Human-readable error message if the daemon encountered a non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Every supervised process, oldest first. Kept last so the TOML tables
    /// follow the plain keys.
    #[serde(default)]
    pub processes: Vec<SupervisedProcess>,
}

impl DaemonStatus {
    /// Constructs the initial status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Local::now(),
            last_shipped: None,
            last_shipped_timestamp: None,
            last_calibration_timestamp: None,
            error: None,
            processes: Vec::new(),
        }
    }

    /// Pulls the process table from `registry`. This is a reaper pass.
    pub fn refresh_processes(&mut self, registry: &ProcessRegistry) {
        self.processes = registry.list_processes();
    }

    pub fn record_shipment(&mut self, report: &ShipReport) {
        if let Some(last) = report.files.last() {
            self.last_shipped = Some(last.name.clone());
            self.last_shipped_timestamp = Some(report.finished_at.to_rfc3339());
        }
        self.error = report
            .files
            .iter()
            .find(|f| !f.is_complete())
            .map(|f| format!("Shipping {} was incomplete", f.name));
    }

    pub fn record_calibration(&mut self) {
        self.last_calibration_timestamp = Some(Local::now().to_rfc3339());
    }
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors rather than panicking: a status write failure should
/// never crash the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            log::error!("[status] Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                log::error!("[status] Failed to write status file: {e}");
            }
        }
        Err(e) => log::error!("[status] Failed to serialize status: {e}"),
    }
}
