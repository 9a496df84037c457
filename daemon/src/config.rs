use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::event::DaemonEvent;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 5;
/// Finder's per-directory metadata file; never counted as work.
pub const DEFAULT_IGNORED_ENTRY: &str = ".DS_Store";
pub const DEFAULT_PEEK_LIMIT: usize = 32;
pub const DEFAULT_SHIP_BATCH_SIZE: usize = 5;
pub const DEFAULT_METADATA_PREFIX: &str = "DE_";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Root configuration structure. Deserialized from `<home>/config.toml`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Settings shared by every loop.
#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Delay between two polls of the same loop.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often the status file is rewritten.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    /// Directory entry that is ignored by every occupancy check.
    #[serde(default = "default_ignored_entry")]
    pub ignored_entry: String,
    /// Maximum number of entries read by one occupancy check.
    #[serde(default = "default_peek_limit")]
    pub peek_limit: usize,
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            status_interval_secs: DEFAULT_STATUS_INTERVAL_SECS,
            ignored_entry: DEFAULT_IGNORED_ENTRY.to_string(),
            peek_limit: DEFAULT_PEEK_LIMIT,
        }
    }
}

/// Raw video processing and shipping.
#[derive(Debug, Deserialize, Clone)]
pub struct VideoConfig {
    /// Uploaded stereo pairs land here.
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    /// The processor writes its results here.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Holds `<metadata_prefix><stem>.json` for every processed video.
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
    #[serde(default = "default_processor")]
    pub processor: PathBuf,
    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,
    /// Maximum number of output entries shipped per poll.
    #[serde(default = "default_ship_batch_size")]
    pub ship_batch_size: usize,
    /// Remote container receiving processed videos.
    #[serde(default = "default_processed_container")]
    pub processed_container: String,
    /// Remote container receiving metadata files.
    #[serde(default = "default_metadata_container")]
    pub metadata_container: String,
}

impl VideoConfig {
    /// Name of the metadata file belonging to the processed video `video_name`.
    pub fn metadata_name(&self, video_name: &str) -> String {
        let stem = Path::new(video_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| video_name.to_string());
        format!("{}{stem}.json", self.metadata_prefix)
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
            metadata_dir: default_metadata_dir(),
            processor: default_processor(),
            metadata_prefix: default_metadata_prefix(),
            ship_batch_size: DEFAULT_SHIP_BATCH_SIZE,
            processed_container: default_processed_container(),
            metadata_container: default_metadata_container(),
        }
    }
}

/// Stereo camera calibration.
#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    #[serde(default = "default_calibrator")]
    pub calibrator: PathBuf,
    /// Left camera image directory to calibrate from. Empty means unset.
    #[serde(default)]
    pub left_dir: PathBuf,
    /// Right camera image directory to calibrate from. Empty means unset.
    #[serde(default)]
    pub right_dir: PathBuf,
}

impl CalibrationConfig {
    /// Returns the configured directory pair when both sides are set.
    pub fn requested_dirs(&self) -> Option<(PathBuf, PathBuf)> {
        if self.left_dir.as_os_str().is_empty() || self.right_dir.as_os_str().is_empty() {
            return None;
        }
        Some((self.left_dir.clone(), self.right_dir.clone()))
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            calibrator: default_calibrator(),
            left_dir: PathBuf::new(),
            right_dir: PathBuf::new(),
        }
    }
}

/// How external executables are run.
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Kill a run that takes longer than this. Unset waits forever.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Total attempts for a run that fails to spawn or exits unsuccessfully.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl SupervisorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.backoff_initial_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

/// Directory-backed remote storage.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            log::error!("[config] Failed to create file watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => {
            log::error!("[config] Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        log::error!("[config] Failed to watch config directory: {e}");
        return;
    }

    let file_name = path.file_name().map(|n| n.to_os_string());
    while let Some(event) = watch_rx.recv().await {
        let affects_config = event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("[config] Failed to reload config: {e:#}"),
            }
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_status_interval_secs() -> u64 {
    DEFAULT_STATUS_INTERVAL_SECS
}

fn default_ignored_entry() -> String {
    DEFAULT_IGNORED_ENTRY.to_string()
}

fn default_peek_limit() -> usize {
    DEFAULT_PEEK_LIMIT
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("static/videos")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("static/proc_videos")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("static/video-info")
}

fn default_processor() -> PathBuf {
    PathBuf::from("./FishFinder")
}

fn default_metadata_prefix() -> String {
    DEFAULT_METADATA_PREFIX.to_string()
}

fn default_ship_batch_size() -> usize {
    DEFAULT_SHIP_BATCH_SIZE
}

fn default_processed_container() -> String {
    "processed-videos".to_string()
}

fn default_metadata_container() -> String {
    "video-info".to_string()
}

fn default_calibrator() -> PathBuf {
    PathBuf::from("./Calibrate")
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_initial_ms() -> u64 {
    DEFAULT_BACKOFF_INITIAL_MS
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("remote")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn daemon_config_default_values() {
        let d = DaemonConfig::default();
        assert_eq!(d.poll_interval(), Duration::from_secs(1));
        assert_eq!(d.ignored_entry, ".DS_Store");
        assert_eq!(d.peek_limit, DEFAULT_PEEK_LIMIT);
    }

    #[test]
    fn supervisor_default_does_not_retry_or_time_out() {
        let s = SupervisorConfig::default();
        assert_eq!(s.max_attempts, 1);
        assert!(s.timeout().is_none());
    }

    #[test]
    fn calibration_default_has_no_requested_dirs() {
        assert!(CalibrationConfig::default().requested_dirs().is_none());
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    #[test]
    fn metadata_name_strips_video_extension() {
        let v = VideoConfig::default();
        assert_eq!(v.metadata_name("a.mp4"), "DE_a.json");
        assert_eq!(v.metadata_name("2019-04-01-101500.mp4"), "DE_2019-04-01-101500.json");
        assert_eq!(v.metadata_name("noext"), "DE_noext.json");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = SupervisorConfig {
            timeout_secs: None,
            max_attempts: 5,
            backoff_initial_ms: 100,
            backoff_max_ms: 350,
        };
        assert_eq!(s.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(s.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(s.backoff_for_attempt(3), Duration::from_millis(350));
        assert_eq!(s.backoff_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn requested_dirs_needs_both_sides() {
        let mut c = CalibrationConfig::default();
        c.left_dir = PathBuf::from("static/calibrate/left");
        assert!(c.requested_dirs().is_none());
        c.right_dir = PathBuf::from("static/calibrate/right");
        assert_eq!(
            c.requested_dirs(),
            Some((
                PathBuf::from("static/calibrate/left"),
                PathBuf::from("static/calibrate/right")
            ))
        );
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config.daemon.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.video.processor, PathBuf::from("./FishFinder"));
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[daemon]
poll_interval_ms = 250
peek_limit = 8

[video]
input_dir = "/srv/videos"
processor = "/opt/bin/FishFinder"
processed_container = "80573476756"
metadata_container = "82388040956"

[calibration]
calibrator = "/opt/bin/Calibrate"
left_dir = "/srv/calibrate/left"
right_dir = "/srv/calibrate/right"

[supervisor]
timeout_secs = 600
max_attempts = 3
"#,
        )
        .unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.daemon.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.daemon.peek_limit, 8);
        assert_eq!(config.video.input_dir, PathBuf::from("/srv/videos"));
        assert_eq!(config.video.processed_container, "80573476756");
        assert_eq!(config.video.metadata_container, "82388040956");
        assert!(config.calibration.requested_dirs().is_some());
        assert_eq!(config.supervisor.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.supervisor.max_attempts, 3);
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[video]\nship_batch_size = 10\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.video.ship_batch_size, 10);
        assert_eq!(config.video.metadata_prefix, DEFAULT_METADATA_PREFIX);
        assert_eq!(config.daemon.ignored_entry, DEFAULT_IGNORED_ENTRY);
        assert_eq!(config.supervisor.backoff_max_ms, DEFAULT_BACKOFF_MAX_MS);
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(load_or_default(&path).is_err());
    }
}
