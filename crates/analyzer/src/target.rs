#![forbid(unsafe_code)]

use crate::error::AttachError;
use procfs::ProcError;
use procfs::process::Process;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Exited,
    /// procfs could not tell (usually a permission problem).
    Unknown,
}

/// A process we were asked to inspect. We never own its lifecycle.
///
/// The start time recorded at lookup pins the identity: if the pid is later
/// reused by an unrelated process the start time differs and the original
/// target counts as exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProcess {
    pid: i32,
    start_time: u64,
    name: String,
    owner_uid: u32,
}

impl TargetProcess {
    /// Resolve a pid to a live process.
    pub fn lookup(pid: i32) -> Result<Self, AttachError> {
        if pid <= 0 {
            return Err(AttachError::TargetExited { pid });
        }
        let process = Process::new(pid).map_err(|err| proc_error(pid, err))?;
        let stat = process.stat().map_err(|err| proc_error(pid, err))?;
        if is_dead(stat.state) {
            return Err(AttachError::TargetExited { pid });
        }
        let owner_uid = process.uid().map_err(|err| proc_error(pid, err))?;

        trace!(pid, name = %stat.comm, owner_uid, "target resolved");
        Ok(Self {
            pid,
            start_time: stat.starttime,
            name: stat.comm,
            owner_uid,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_uid(&self) -> u32 {
        self.owner_uid
    }

    pub fn liveness(&self) -> Liveness {
        match Process::new(self.pid).and_then(|process| process.stat()) {
            Ok(stat) if stat.starttime != self.start_time => Liveness::Exited,
            Ok(stat) if is_dead(stat.state) => Liveness::Exited,
            Ok(_) => Liveness::Alive,
            Err(ProcError::NotFound(_)) => Liveness::Exited,
            Err(err) => {
                trace!(pid = self.pid, ?err, "liveness unknown");
                Liveness::Unknown
            }
        }
    }

    /// Pid of the process currently ptrace-attached to the target, if any.
    pub fn tracer_pid(&self) -> Option<i32> {
        let status = Process::new(self.pid)
            .and_then(|process| process.status())
            .ok()?;
        (status.tracerpid > 0).then_some(status.tracerpid)
    }

    /// Resolves once the target is observed to have exited.
    pub async fn exited(&self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.liveness() == Liveness::Exited {
                return;
            }
        }
    }
}

fn is_dead(state: char) -> bool {
    matches!(state, 'Z' | 'X' | 'x')
}

fn proc_error(pid: i32, err: ProcError) -> AttachError {
    match err {
        ProcError::NotFound(_) => AttachError::TargetExited { pid },
        ProcError::PermissionDenied(_) => AttachError::Denied {
            cause: format!("cannot inspect /proc/{pid}: permission denied"),
        },
        other => AttachError::Backend {
            cause: other.to_string(),
        },
    }
}
