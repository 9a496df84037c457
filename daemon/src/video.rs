/// Video processing and shipping loop.
///
/// Each poll either starts the processor, when the input directory holds
/// complete stereo pairs, or ships a bounded batch of finished output to
/// remote storage. Shipping is at-least-once: a crash between upload and
/// local deletion leaves the file in place and the next poll uploads it again.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::{Config, DaemonConfig, VideoConfig};
use crate::error::OrchestrationError;
use crate::event::DaemonEvent;
use crate::occupancy;
use crate::storage::RemoteStorage;
use crate::supervisor::Supervisor;

/// What happened to one processed video during shipping.
#[derive(Debug, Clone)]
pub struct ShippedFile {
    pub name: String,
    pub video_uploaded: bool,
    pub local_removed: bool,
    pub metadata_uploaded: bool,
}

impl ShippedFile {
    pub fn is_complete(&self) -> bool {
        self.video_uploaded && self.local_removed && self.metadata_uploaded
    }
}

#[derive(Debug, Clone)]
pub struct ShipReport {
    pub files: Vec<ShippedFile>,
    pub finished_at: DateTime<Local>,
}

#[derive(Debug)]
pub enum PollOutcome {
    /// The processor was run to completion.
    Processed,
    /// A batch of output was shipped.
    Shipped(ShipReport),
    Idle,
}

pub struct VideoPipeline {
    config: Arc<RwLock<Config>>,
    supervisor: Supervisor,
    storage: Arc<dyn RemoteStorage>,
    events: mpsc::Sender<DaemonEvent>,
}

impl VideoPipeline {
    pub fn new(
        config: Arc<RwLock<Config>>,
        supervisor: Supervisor,
        storage: Arc<dyn RemoteStorage>,
        events: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        Self {
            config,
            supervisor,
            storage,
            events,
        }
    }

    /// Polls forever until `stop` flips to `true` or its sender is dropped.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let period = self.config.read().await.daemon.poll_interval();
        let mut ticker = interval(period);
        // A processor run can outlast many periods; don't burst afterwards.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            if let PollOutcome::Shipped(report) = self.poll_once().await {
                if self.events.send(DaemonEvent::Shipped(report)).await.is_err() {
                    log::debug!("[video] Event receiver closed");
                }
            }
        }
        log::debug!("[video] Loop stopped");
    }

    pub async fn poll_once(&self) -> PollOutcome {
        // Release the read lock before any awaits below.
        let (daemon, video) = {
            let cfg = self.config.read().await;
            (cfg.daemon.clone(), cfg.video.clone())
        };

        // Parity needs the exact count once the peek overflows its bound.
        let input = occupancy::check(&video.input_dir, &daemon.ignored_entry, daemon.peek_limit)
            .and_then(|peek| match peek.saturated {
                true => occupancy::count_all(&video.input_dir, &daemon.ignored_entry),
                false => Ok(peek),
            });
        let input = match input {
            Ok(input) => input,
            // Without an input directory nothing is processed or shipped.
            Err(e) => {
                log::debug!("[video] {e}");
                return PollOutcome::Idle;
            }
        };

        if input.holds_pairs() {
            log::info!("[video] {} input files ready, starting processor", input.count);
            let no_args: &[&str] = &[];
            self.supervisor.run(&video.processor, no_args).await;
            return PollOutcome::Processed;
        }

        if !occupancy::has_work(&video.output_dir, &daemon.ignored_entry, daemon.peek_limit) {
            return PollOutcome::Idle;
        }

        let files = self.ship_batch(&daemon, &video).await;
        if files.is_empty() {
            return PollOutcome::Idle;
        }
        PollOutcome::Shipped(ShipReport {
            files,
            finished_at: Local::now(),
        })
    }

    /// Ships up to `ship_batch_size` entries of the output directory.
    async fn ship_batch(&self, daemon: &DaemonConfig, video: &VideoConfig) -> Vec<ShippedFile> {
        let entries = match std::fs::read_dir(&video.output_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("[video] Cannot read {}: {e}", video.output_dir.display());
                return Vec::new();
            }
        };

        // Entries that can never ship are skipped before the bound so they
        // don't hold batch slots on every poll.
        let batch: Vec<(String, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name() != daemon.ignored_entry.as_str())
            .filter(|entry| {
                let is_file = entry.file_type().is_ok_and(|t| t.is_file());
                if !is_file {
                    log::debug!("[video] Skipping {}: not a regular file", entry.path().display());
                }
                is_file
            })
            .filter_map(|entry| match entry.file_name().into_string() {
                Ok(name) => Some((name, entry.path())),
                Err(raw) => {
                    log::warn!("[video] Skipping {}: name is not valid UTF-8", raw.to_string_lossy());
                    None
                }
            })
            .take(video.ship_batch_size)
            .collect();

        let mut shipped = Vec::with_capacity(batch.len());
        for (name, path) in batch {
            shipped.push(self.ship_file(video, name, &path).await);
        }
        shipped
    }

    /// Uploads one processed video, removes it locally, then uploads its
    /// metadata file. Each step runs even if an earlier one failed.
    async fn ship_file(&self, video: &VideoConfig, name: String, path: &Path) -> ShippedFile {
        let video_uploaded = self
            .storage
            .upload(path, &name, &video.processed_container)
            .await
            .inspect_err(|e| log::error!("[video] {e}"))
            .is_ok();

        let local_removed = remove_file(path)
            .await
            .inspect_err(|e| log::error!("[video] {e}"))
            .is_ok();

        let metadata_name = video.metadata_name(&name);
        let metadata_path = video.metadata_dir.join(&metadata_name);
        let metadata_uploaded = self
            .storage
            .upload(&metadata_path, &metadata_name, &video.metadata_container)
            .await
            .inspect_err(|e| log::error!("[video] {e}"))
            .is_ok();

        // The local metadata copy is only dropped once it is safely remote.
        if metadata_uploaded {
            if let Err(e) = remove_file(&metadata_path).await {
                log::error!("[video] {e}");
            }
        }

        let file = ShippedFile {
            name,
            video_uploaded,
            local_removed,
            metadata_uploaded,
        };
        if file.is_complete() {
            log::info!("[video] Shipped {}", file.name);
        } else {
            log::warn!("[video] Shipped {} with errors: {file:?}", file.name);
        }
        file
    }
}

async fn remove_file(path: &Path) -> Result<(), OrchestrationError> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|source| OrchestrationError::Cleanup {
            path: path.to_path_buf(),
            source,
        })
}
