use crate::controller::RunStatus;
use std::path::PathBuf;
use std::time::Duration;

/// The host's ptrace policy does not let us attach.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("host policy forbids attach (ptrace_scope = {policy_value}): {hint}")]
    Forbidden {
        policy_value: u32,
        hint: &'static str,
    },

    #[error("ptrace policy at {} holds {raw:?}, expected an integer", path.display())]
    Malformed { path: PathBuf, raw: String },

    #[error("failed to read ptrace policy at {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("declaring a ptracer is only supported on Linux")]
    Unsupported,

    #[error("prctl(PR_SET_PTRACER) failed: {0}")]
    Os(#[from] nix::Error),
}

/// Failure reported by a [`DebugBackend`](crate::backend::DebugBackend).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("attach refused: {0}")]
    Denied(String),

    #[error("no such process")]
    NoSuchProcess,

    #[error("target exited")]
    TargetExited,

    #[error("debugger exited unexpectedly")]
    Closed,

    #[error("{0}")]
    Command(String),

    #[error("failed to talk to the debugger: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("attach did not complete within {after:?}")]
    Timeout { after: Duration },

    #[error("attach denied: {cause}")]
    Denied { cause: String },

    #[error("target process {pid} is gone")]
    TargetExited { pid: i32 },

    #[error("a session is already bound to process {pid}")]
    AlreadyAttached { pid: i32 },

    #[error("attach failed: {cause}")]
    Backend { cause: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DetachError {
    #[error("detach did not complete within {after:?}")]
    Timeout { after: Duration },

    #[error("detach failed: {cause}")]
    Backend { cause: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("introspection did not return within {after:?}")]
    Timeout { after: Duration },

    #[error("target process {pid} exited during introspection")]
    TargetExited { pid: i32 },

    #[error("injected routine failed: {cause}")]
    InjectionFailed { cause: String },

    #[error("introspection output does not match its schema: {reason}")]
    MalformedOutput { reason: String },

    #[error("session is not attached")]
    NotAttached,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode snapshot: {0}")]
    Encode(String),

    #[error("failed to decode snapshot: {0}")]
    Decode(String),

    #[error("not a snapshot file")]
    BadMagic,

    #[error("unsupported snapshot schema version {found}")]
    UnsupportedSchema { found: u32 },

    #[error("snapshot payload is {actual} bytes, header declares {expected}")]
    Truncated { expected: u64, actual: u64 },

    #[error("snapshot write did not complete within {after:?}")]
    Timeout { after: Duration },
}

/// Everything that can end a run early.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Write(#[from] SnapshotError),

    #[error("run cancelled")]
    Cancelled,
}

impl RunError {
    pub fn status(&self) -> RunStatus {
        match self {
            RunError::Permission(_) => RunStatus::PermissionDenied,
            RunError::Attach(AttachError::Timeout { .. }) => RunStatus::AttachTimeout,
            RunError::Attach(AttachError::TargetExited { .. }) => RunStatus::TargetExited,
            RunError::Attach(_) => RunStatus::AttachFailed,
            RunError::Execution(ExecutionError::Timeout { .. }) => RunStatus::ExecutionTimeout,
            RunError::Execution(ExecutionError::TargetExited { .. }) => RunStatus::TargetExited,
            RunError::Execution(_) => RunStatus::IntrospectionError,
            RunError::Write(_) => RunStatus::WriteFailed,
            RunError::Cancelled => RunStatus::Cancelled,
        }
    }
}
