/// Failures the orchestration loops can run into.
///
/// None of these are fatal: the loops log them and carry on with the next file
/// or the next poll.
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A watched directory could not be opened. Treated as "no work".
    #[error("cannot open directory {}: {source}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The external executable could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The executable started but waiting on it failed.
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The executable ran longer than the configured timeout and was killed.
    #[error("{program} exceeded its timeout of {timeout:?} and was killed")]
    Timeout { program: String, timeout: Duration },

    /// A remote storage call failed.
    #[error("transfer of {name} failed: {reason}")]
    Transfer { name: String, reason: String },

    /// A local file or directory could not be removed.
    #[error("failed to remove {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl OrchestrationError {
    pub fn transfer(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transfer {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
