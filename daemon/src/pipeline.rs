/// Background pipeline loops for the lifetime of the daemon.
///
/// `Pipelines` owns:
///   - the video loop (process raw pairs, ship results)
///   - the calibration loop (calibrate submitted camera directories)
///
/// Both share the process registry through their supervisors and run
/// independently of each other.
use std::time::Duration;

use tokio::{sync::watch, task::JoinHandle};

use crate::calibration::CalibrationPipeline;
use crate::video::VideoPipeline;

/// How long `stop` waits for a loop to notice the stop signal before aborting it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The running pipeline loops.
pub struct Pipelines {
    /// Setting this to `true` signals every loop to stop after its current poll.
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipelines {
    /// Spawns both loops on the current runtime.
    pub fn start(video: VideoPipeline, calibration: CalibrationPipeline) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        let handles = vec![
            tokio::spawn(video.run(stop_rx.clone())),
            tokio::spawn(calibration.run(stop_rx)),
        ];

        Pipelines { stop_tx, handles }
    }

    /// Signals every loop to stop and waits up to `grace` for each. A loop
    /// still inside an external run is aborted; its child is killed on drop.
    pub async fn stop(self, grace: Duration) {
        let _ = self.stop_tx.send(true);
        for mut handle in self.handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                log::warn!("[pipeline] Loop did not stop within {grace:?}, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}
