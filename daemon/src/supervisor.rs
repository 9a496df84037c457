/// Runs external executables to completion and records each launch in the
/// shared [`ProcessRegistry`].
///
/// `run` blocks the calling loop until the child exits, so a loop never starts
/// a second run of the same stage while one is in flight. The registry record
/// is not updated on exit; the reaper flips it to `dead` on the next
/// `list_processes`.
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::process::Command;

use crate::config::SupervisorConfig;
use crate::error::OrchestrationError;
use crate::registry::ProcessRegistry;

#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<ProcessRegistry>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(registry: Arc<ProcessRegistry>, config: SupervisorConfig) -> Self {
        Self { registry, config }
    }

    /// Runs `program` with `args` until it exits, retrying failed attempts up
    /// to `max_attempts` with exponential backoff.
    ///
    /// Failures are logged, not returned. Yields the exit status of the last
    /// attempt that ran to completion, if any.
    pub async fn run<S: AsRef<OsStr>>(&self, program: &Path, args: &[S]) -> Option<ExitStatus> {
        let name = display_name(program);
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.config.backoff_for_attempt(attempt - 1);
                log::info!("[supervisor] Retrying {name} in {delay:?} (attempt {attempt}/{max_attempts})");
                tokio::time::sleep(delay).await;
            }

            match self.run_once(program, args).await {
                Ok(status) if status.success() => {
                    log::info!("[supervisor] {name} finished successfully");
                    return Some(status);
                }
                Ok(status) => {
                    log::warn!("[supervisor] {name} exited with {status}");
                    last_status = Some(status);
                }
                Err(e) => log::error!("[supervisor] {e}"),
            }
        }

        last_status
    }

    /// One attempt: spawn, register, wait.
    pub async fn run_once<S: AsRef<OsStr>>(
        &self,
        program: &Path,
        args: &[S],
    ) -> Result<ExitStatus, OrchestrationError> {
        let name = display_name(program);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OrchestrationError::Spawn {
                program: name.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| OrchestrationError::Spawn {
            program: name.clone(),
            source: io::Error::other("process exited before its PID was read"),
        })?;

        self.registry.register(name.clone(), pid);
        log::info!("[supervisor] Started process {name} with PID {pid}");

        let Some(timeout) = self.config.timeout() else {
            return child
                .wait()
                .await
                .map_err(|source| OrchestrationError::Wait { program: name, source });
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result.map_err(|source| OrchestrationError::Wait { program: name, source }),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    log::error!("[supervisor] Failed to kill {name} (PID {pid}): {e}");
                }
                Err(OrchestrationError::Timeout { program: name, timeout })
            }
        }
    }
}

/// Name shown in the process table: the executable's file name.
pub fn display_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}
