use crate::calibration::CalibrationDirs;
use crate::config::Config;
use crate::video::ShipReport;

pub enum DaemonEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// The video loop finished shipping a batch of processed output.
    Shipped(ShipReport),
    /// The calibration loop ran the calibrator over this directory pair.
    CalibrationFinished(CalibrationDirs),
    /// Ctrl+C received; the daemon should stop its loops and exit.
    Shutdown,
}
