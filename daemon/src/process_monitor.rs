use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Answers whether the OS still recognises a PID.
///
/// A positive answer only says that *some* process holds the PID. If the OS
/// has recycled it since the original exited, the probe cannot tell.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes the OS process table through `sysinfo`. Zombies count as dead.
#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl LivenessProbe for SysinfoProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);

        sys.process(pid)
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }
}
