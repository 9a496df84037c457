/// Stereo calibration loop.
///
/// Whoever receives calibration images submits the left/right directory pair
/// through [`CalibrationHandoff`]. Once both directories hold files, the loop
/// runs the calibrator over them, removes both directories, and clears the
/// handoff.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::error::OrchestrationError;
use crate::event::DaemonEvent;
use crate::occupancy;
use crate::supervisor::Supervisor;

/// Left and right camera image directories. An empty path means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalibrationDirs {
    pub left: PathBuf,
    pub right: PathBuf,
}

impl CalibrationDirs {
    pub fn is_unset(&self) -> bool {
        self.left.as_os_str().is_empty() || self.right.as_os_str().is_empty()
    }
}

/// Synchronized slot handing calibration directories to the loop.
#[derive(Debug, Default)]
pub struct CalibrationHandoff {
    dirs: Mutex<CalibrationDirs>,
}

impl CalibrationHandoff {
    fn lock(&self) -> MutexGuard<'_, CalibrationDirs> {
        self.dirs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the pending pair.
    pub fn submit(&self, left: impl Into<PathBuf>, right: impl Into<PathBuf>) {
        *self.lock() = CalibrationDirs {
            left: left.into(),
            right: right.into(),
        };
    }

    pub fn current(&self) -> CalibrationDirs {
        self.lock().clone()
    }

    /// Resets both entries to empty, but only if they still hold `dirs`.
    /// A pair submitted while the calibrator was running is kept.
    pub fn clear_if(&self, dirs: &CalibrationDirs) -> bool {
        let mut current = self.lock();
        if *current != *dirs {
            return false;
        }
        *current = CalibrationDirs::default();
        true
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// The calibrator ran and the working directories were cleaned up.
    Calibrated,
    /// Nothing to do this poll.
    Idle,
}

pub struct CalibrationPipeline {
    config: Arc<RwLock<Config>>,
    supervisor: Supervisor,
    handoff: Arc<CalibrationHandoff>,
    events: mpsc::Sender<DaemonEvent>,
}

impl CalibrationPipeline {
    pub fn new(
        config: Arc<RwLock<Config>>,
        supervisor: Supervisor,
        handoff: Arc<CalibrationHandoff>,
        events: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        Self {
            config,
            supervisor,
            handoff,
            events,
        }
    }

    /// Polls forever until `stop` flips to `true` or its sender is dropped.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let period = self.config.read().await.daemon.poll_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            self.poll_once().await;
        }
        log::debug!("[calibration] Loop stopped");
    }

    pub async fn poll_once(&self) -> CalibrationOutcome {
        let dirs = self.handoff.current();
        if dirs.is_unset() {
            return CalibrationOutcome::Idle;
        }

        let (calibrator, ignored, peek_limit) = {
            let cfg = self.config.read().await;
            (
                cfg.calibration.calibrator.clone(),
                cfg.daemon.ignored_entry.clone(),
                cfg.daemon.peek_limit,
            )
        };

        let ready = [&dirs.left, &dirs.right]
            .into_iter()
            .all(|dir| occupancy::has_work(dir, &ignored, peek_limit));
        if !ready {
            return CalibrationOutcome::Idle;
        }

        log::info!(
            "[calibration] Calibrating from {} and {}",
            dirs.left.display(),
            dirs.right.display()
        );
        // The exit status is not surfaced; cleanup happens either way.
        self.supervisor
            .run(&calibrator, &[dirs.left.as_os_str(), dirs.right.as_os_str()])
            .await;

        for dir in [&dirs.left, &dirs.right] {
            if let Err(e) = remove_dir(dir).await {
                log::error!("[calibration] {e}");
            }
        }
        self.handoff.clear_if(&dirs);

        if self.events.send(DaemonEvent::CalibrationFinished(dirs)).await.is_err() {
            log::debug!("[calibration] Event receiver closed");
        }
        CalibrationOutcome::Calibrated
    }
}

async fn remove_dir(dir: &Path) -> Result<(), OrchestrationError> {
    tokio::fs::remove_dir_all(dir)
        .await
        .map_err(|source| OrchestrationError::Cleanup {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::registry::ProcessRegistry;

    struct Fixture {
        _root: tempfile::TempDir,
        left: PathBuf,
        right: PathBuf,
        pipeline: CalibrationPipeline,
        handoff: Arc<CalibrationHandoff>,
        registry: Arc<ProcessRegistry>,
        events: mpsc::Receiver<DaemonEvent>,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let left = root.path().join("left");
        let right = root.path().join("right");
        std::fs::create_dir_all(&left).unwrap();
        std::fs::create_dir_all(&right).unwrap();

        let mut config = Config::default();
        config.calibration.calibrator = PathBuf::from("true");

        let registry = Arc::new(ProcessRegistry::new());
        let supervisor = Supervisor::new(Arc::clone(&registry), SupervisorConfig::default());
        let handoff = Arc::new(CalibrationHandoff::default());
        let (tx, rx) = mpsc::channel(8);
        let pipeline = CalibrationPipeline::new(
            Arc::new(RwLock::new(config)),
            supervisor,
            Arc::clone(&handoff),
            tx,
        );

        Fixture {
            _root: root,
            left,
            right,
            pipeline,
            handoff,
            registry,
            events: rx,
        }
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"jpg").unwrap();
    }

    // ── handoff ───────────────────────────────────────────────────────────────

    #[test]
    fn handoff_starts_unset() {
        assert!(CalibrationHandoff::default().current().is_unset());
    }

    #[test]
    fn clear_if_keeps_a_newer_submission() {
        let handoff = CalibrationHandoff::default();
        handoff.submit("a/left", "a/right");
        let processed = handoff.current();

        handoff.submit("b/left", "b/right");
        assert!(!handoff.clear_if(&processed));
        assert_eq!(handoff.current().left, PathBuf::from("b/left"));
    }

    #[test]
    fn clear_if_resets_to_empty_paths() {
        let handoff = CalibrationHandoff::default();
        handoff.submit("a/left", "a/right");
        let processed = handoff.current();

        assert!(handoff.clear_if(&processed));
        let current = handoff.current();
        assert!(current.left.as_os_str().is_empty());
        assert!(current.right.as_os_str().is_empty());
    }

    // ── loop ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn calibrates_and_cleans_up_when_both_sides_have_images() {
        let mut fx = fixture();
        touch(&fx.left, "l0.jpg");
        touch(&fx.right, "r0.jpg");
        fx.handoff.submit(&fx.left, &fx.right);

        assert_eq!(fx.pipeline.poll_once().await, CalibrationOutcome::Calibrated);

        assert!(!fx.left.exists());
        assert!(!fx.right.exists());
        let current = fx.handoff.current();
        assert!(current.left.as_os_str().is_empty());
        assert!(current.right.as_os_str().is_empty());

        let records = fx.registry.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "true");
        assert!(matches!(
            fx.events.try_recv(),
            Ok(DaemonEvent::CalibrationFinished(_))
        ));
    }

    #[tokio::test]
    async fn idle_when_one_side_is_empty() {
        let fx = fixture();
        touch(&fx.left, "l0.jpg");
        touch(&fx.right, ".DS_Store");
        fx.handoff.submit(&fx.left, &fx.right);

        assert_eq!(fx.pipeline.poll_once().await, CalibrationOutcome::Idle);
        assert!(fx.left.exists());
        assert_eq!(fx.registry.len(), 0);
    }

    #[tokio::test]
    async fn idle_when_nothing_submitted() {
        let fx = fixture();
        touch(&fx.left, "l0.jpg");
        touch(&fx.right, "r0.jpg");

        assert_eq!(fx.pipeline.poll_once().await, CalibrationOutcome::Idle);
        assert_eq!(fx.registry.len(), 0);
    }

    #[tokio::test]
    async fn missing_directories_count_as_no_work() {
        let fx = fixture();
        fx.handoff.submit(fx.left.join("gone"), fx.right.join("gone"));

        assert_eq!(fx.pipeline.poll_once().await, CalibrationOutcome::Idle);
        assert_eq!(fx.registry.len(), 0);
    }

    #[tokio::test]
    async fn calibrator_failure_still_cleans_up() {
        let fx = fixture();
        touch(&fx.left, "l0.jpg");
        touch(&fx.right, "r0.jpg");
        fx.handoff.submit(&fx.left, &fx.right);
        fx.pipeline.config.write().await.calibration.calibrator = PathBuf::from("false");

        assert_eq!(fx.pipeline.poll_once().await, CalibrationOutcome::Calibrated);
        assert!(!fx.left.exists());
        assert!(fx.handoff.current().is_unset());
    }

    #[tokio::test]
    async fn failed_cleanup_is_logged_and_the_loop_moves_on() {
        let mut fx = fixture();
        touch(&fx.left, "l0.jpg");
        // Both sides name one directory, so the second removal fails.
        fx.handoff.submit(&fx.left, &fx.left);

        assert_eq!(fx.pipeline.poll_once().await, CalibrationOutcome::Calibrated);
        assert!(!fx.left.exists());
        assert!(fx.handoff.current().is_unset());
        assert!(matches!(
            fx.events.try_recv(),
            Ok(DaemonEvent::CalibrationFinished(_))
        ));

        assert_eq!(fx.pipeline.poll_once().await, CalibrationOutcome::Idle);
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_dir_reports_cleanup_error() {
        let fx = fixture();
        let err = remove_dir(&fx.left.join("gone")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Cleanup { .. }));
    }

    #[tokio::test]
    async fn run_stops_when_signalled() {
        let fx = fixture();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(fx.pipeline.run(stop_rx));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
