/// Shared table of supervised processes.
///
/// The supervisor appends a record for every process it starts; readers call
/// [`ProcessRegistry::list_processes`], which also re-probes every active
/// record and flips the ones whose PID has disappeared to `dead`. Both paths
/// take the same lock, but probes run outside it.
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::process_monitor::{LivenessProbe, SysinfoProbe};

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Active,
    Dead,
}

/// One launch of an external executable.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SupervisedProcess {
    /// Registry-unique record identity. PIDs may be reused, this is not.
    pub id: u64,
    /// Display name derived from the executable path.
    pub name: String,
    pub pid: u32,
    pub status: ProcessState,
    pub started_at: DateTime<Local>,
    /// Time the reaper first observed the process gone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Local>>,
}

impl SupervisedProcess {
    pub fn is_active(&self) -> bool {
        self.status == ProcessState::Active
    }

    /// `active -> dead` only; a dead record stays dead.
    fn mark_dead(&mut self, at: DateTime<Local>) {
        if self.is_active() {
            self.status = ProcessState::Dead;
            self.ended_at = Some(at);
        }
    }
}

#[derive(Default)]
struct Records {
    next_id: u64,
    entries: Vec<SupervisedProcess>,
}

pub struct ProcessRegistry {
    records: Mutex<Records>,
    probe: Box<dyn LivenessProbe>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::with_probe(Box::new(SysinfoProbe))
    }

    pub fn with_probe(probe: Box<dyn LivenessProbe>) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            probe,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends an `active` record for a freshly spawned process and returns its id.
    pub fn register(&self, name: impl Into<String>, pid: u32) -> u64 {
        let mut records = self.lock();
        let id = records.next_id;
        records.next_id += 1;
        records.entries.push(SupervisedProcess {
            id,
            name: name.into(),
            pid,
            status: ProcessState::Active,
            started_at: Local::now(),
            ended_at: None,
        });
        id
    }

    /// Returns the records in insertion order without probing.
    pub fn snapshot(&self) -> Vec<SupervisedProcess> {
        self.lock().entries.clone()
    }

    /// Re-probes every active record, marks the vanished ones dead, and
    /// returns the updated table in insertion order.
    ///
    /// Probing happens without the lock held, so `register` is never blocked
    /// behind a slow liveness check.
    pub fn list_processes(&self) -> Vec<SupervisedProcess> {
        let active: Vec<(u64, u32)> = self
            .lock()
            .entries
            .iter()
            .filter(|r| r.is_active())
            .map(|r| (r.id, r.pid))
            .collect();

        let gone: HashSet<u64> = active
            .into_iter()
            .filter(|&(_, pid)| !self.probe.is_alive(pid))
            .map(|(id, _)| id)
            .collect();

        let mut records = self.lock();
        let now = Local::now();
        for record in records
            .entries
            .iter_mut()
            .filter(|r| r.is_active() && gone.contains(&r.id))
        {
            log::debug!("[registry] {} (PID {}) is gone", record.name, record.pid);
            record.mark_dead(now);
        }
        records.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}
