mod calibration;
mod config;
mod error;
mod event;
mod logger;
mod occupancy;
mod paths;
mod pipeline;
mod process_monitor;
mod registry;
mod status;
mod storage;
mod supervisor;
mod video;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

use crate::calibration::{CalibrationHandoff, CalibrationPipeline};
use crate::registry::ProcessRegistry;
use crate::storage::{DirectoryStorage, RemoteStorage};
use crate::supervisor::Supervisor;
use crate::video::VideoPipeline;

/// Mode keyword telling the processor to triangulate measured points.
const TRIANGULATE_MODE: &str = "TRIANGULATE";

#[derive(Parser)]
#[command(version, about = "Stereo video capture processing daemon")]
struct Cli {
    /// Config file to use instead of `<home>/config.toml`.
    #[arg(long, env = "CAPTURE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the processing and calibration loops until Ctrl+C (default).
    Run,
    /// Run the processor once in triangulation mode and wait for it.
    Triangulate,
    /// List the processed videos held in remote storage.
    List {
        #[arg(long, default_value_t = storage::LIST_PAGE_SIZE)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Download a processed video and its metadata from remote storage.
    Fetch {
        name: String,
        /// Where the video is written.
        #[arg(long, default_value = "static/temp")]
        dest: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = logger::init() {
        eprintln!("Failed to initialise logging: {e}");
    }

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(paths::config_file_path);
    let config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        log::error!("[config] Error (using defaults): {e:#}");
        config::Config::default()
    });

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            serve(config_path, config).await;
            Ok(())
        }
        Command::Triangulate => triangulate(config).await,
        Command::List { limit, offset } => list(config, limit, offset).await,
        Command::Fetch { name, dest } => fetch(config, &name, dest).await,
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

/// Starts both pipeline loops and runs the event loop until Ctrl+C.
async fn serve(config_path: PathBuf, initial_config: config::Config) {
    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir();
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        log::error!("Failed to create app data directory {}: {e}", app_dir.display());
        std::process::exit(1);
    }

    // ── Shared state ──────────────────────────────────────────────────────────
    let registry = Arc::new(ProcessRegistry::new());
    let handoff = Arc::new(CalibrationHandoff::default());
    if let Some((left, right)) = initial_config.calibration.requested_dirs() {
        handoff.submit(left, right);
    }
    let status_period = initial_config.daemon.status_interval();
    let supervisor = Supervisor::new(Arc::clone(&registry), initial_config.supervisor.clone());
    let storage: Arc<dyn RemoteStorage> =
        Arc::new(DirectoryStorage::new(initial_config.storage.root.clone()));
    let shared_config = Arc::new(RwLock::new(initial_config));

    // ── Initial status ────────────────────────────────────────────────────────
    let status_path = paths::status_file_path();
    let mut current_status = status::DaemonStatus::new();
    status::write_status(&status_path, &current_status);

    let (event_tx, mut event_rx) = mpsc::channel::<event::DaemonEvent>(32);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));

    let pipelines = pipeline::Pipelines::start(
        VideoPipeline::new(
            Arc::clone(&shared_config),
            supervisor.clone(),
            storage,
            event_tx.clone(),
        ),
        CalibrationPipeline::new(
            Arc::clone(&shared_config),
            supervisor,
            Arc::clone(&handoff),
            event_tx.clone(),
        ),
    );

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(event::DaemonEvent::Shutdown).await;
            }
        });
    }

    log::info!("capture-daemon v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    let mut status_ticker = interval(status_period);
    status_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let evt = tokio::select! {
            Some(evt) = event_rx.recv() => evt,
            _ = status_ticker.tick() => {
                current_status.refresh_processes(&registry);
                status::write_status(&status_path, &current_status);
                continue;
            }
        };

        match evt {
            event::DaemonEvent::ConfigReloaded(new_config) => {
                log::info!("Config reloaded");
                if let Some((left, right)) = new_config.calibration.requested_dirs() {
                    log::info!("[calibration] Queued {} and {}", left.display(), right.display());
                    handoff.submit(left, right);
                }
                *shared_config.write().await = new_config;
            }

            event::DaemonEvent::Shipped(report) => {
                current_status.record_shipment(&report);
                current_status.refresh_processes(&registry);
                status::write_status(&status_path, &current_status);
            }

            event::DaemonEvent::CalibrationFinished(dirs) => {
                log::info!(
                    "[calibration] Finished {} and {}",
                    dirs.left.display(),
                    dirs.right.display()
                );
                current_status.record_calibration();
                current_status.refresh_processes(&registry);
                status::write_status(&status_path, &current_status);
            }

            event::DaemonEvent::Shutdown => {
                log::info!("Shutting down ({} processes supervised)", registry.len());
                break;
            }
        }
    }

    pipelines.stop(pipeline::SHUTDOWN_GRACE).await;
    current_status.refresh_processes(&registry);
    status::write_status(&status_path, &current_status);
}

/// Runs the processor once with the triangulation keyword.
async fn triangulate(config: config::Config) -> Result<()> {
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = Supervisor::new(Arc::clone(&registry), config.supervisor.clone());

    let status = supervisor
        .run_once(&config.video.processor, &[TRIANGULATE_MODE])
        .await
        .context("Triangulation failed")?;
    if let Some(record) = registry.snapshot().last() {
        log::debug!("Triangulation ran as PID {}", record.pid);
    }
    if !status.success() {
        anyhow::bail!("{} exited with {status}", config.video.processor.display());
    }
    log::info!("Triangulation finished");
    Ok(())
}

async fn list(config: config::Config, limit: usize, offset: usize) -> Result<()> {
    let storage = DirectoryStorage::new(config.storage.root);
    let entries = storage
        .list_entries(&config.video.processed_container, limit, offset)
        .await
        .context("Failed to list processed videos")?;
    for entry in entries {
        println!("{}", entry.name);
    }
    Ok(())
}

/// Brings a processed video back to local disk, along with its metadata file
/// when that is not already present.
async fn fetch(config: config::Config, name: &str, dest: PathBuf) -> Result<()> {
    let storage = DirectoryStorage::new(config.storage.root.clone());
    let video = &config.video;

    let path = storage::fetch_by_name(&storage, &video.processed_container, name, &dest)
        .await
        .with_context(|| format!("Failed to fetch {name}"))?;
    println!("{}", path.display());

    let metadata_name = video.metadata_name(name);
    if !video.metadata_dir.join(&metadata_name).exists() {
        let path = storage::fetch_by_name(
            &storage,
            &video.metadata_container,
            &metadata_name,
            &video.metadata_dir,
        )
        .await
        .with_context(|| format!("Failed to fetch {metadata_name}"))?;
        println!("{}", path.display());
    }
    Ok(())
}
