/// Directory occupancy check used by the pipeline loops to decide whether a
/// watched directory holds work.
///
/// At most `peek_limit + 1` counted entries are read. The platform metadata
/// entry named by `ignored` (normally `.DS_Store`) never counts and never uses
/// up the bound.
use std::path::Path;

use crate::error::OrchestrationError;

/// Snapshot of a directory taken on one poll. Never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub empty: bool,
    /// Counted entries, capped at the peek bound.
    pub count: usize,
    /// More entries exist than the peek bound allowed reading, so `count` is
    /// a floor and its parity means nothing.
    pub saturated: bool,
}

impl Occupancy {
    /// True when the directory looks like it holds complete stereo pairs:
    /// at least two files and an even count. A saturated peek never does.
    ///
    /// A single stray file breaks the pairing and stalls processing until it
    /// is removed.
    pub fn holds_pairs(&self) -> bool {
        !self.empty && !self.saturated && self.count > 1 && self.count % 2 == 0
    }
}

/// Peeks at `dir` and reports whether it is empty and how many entries it holds.
///
/// Fails with [`OrchestrationError::NotFound`] if the directory cannot be opened.
pub fn check(dir: &Path, ignored: &str, peek_limit: usize) -> Result<Occupancy, OrchestrationError> {
    let entries = std::fs::read_dir(dir).map_err(|source| OrchestrationError::NotFound {
        path: dir.to_path_buf(),
        source,
    })?;

    // Entries that vanish or error mid-listing are skipped; the next poll sees
    // the directory again.
    let seen = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() != ignored)
        .take(peek_limit.saturating_add(1))
        .count();
    let saturated = seen > peek_limit;
    let count = seen.min(peek_limit);

    Ok(Occupancy {
        empty: count == 0,
        count,
        saturated,
    })
}

/// Counts every entry of `dir` except `ignored`. Never saturated.
pub fn count_all(dir: &Path, ignored: &str) -> Result<Occupancy, OrchestrationError> {
    check(dir, ignored, usize::MAX)
}

/// Like [`check`], but a directory that cannot be opened counts as empty.
pub fn has_work(dir: &Path, ignored: &str, peek_limit: usize) -> bool {
    match check(dir, ignored, peek_limit) {
        Ok(occupancy) => !occupancy.empty,
        Err(e) => {
            log::debug!("[occupancy] {e}");
            false
        }
    }
}
