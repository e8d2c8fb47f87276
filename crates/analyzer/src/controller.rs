#![forbid(unsafe_code)]

//! One end-to-end capture: gate, attach, introspect, write, detach.

use crate::backend::{BackendFactory, GdbFactory};
use crate::driver::{IntrospectionDriver, IntrospectionRequest, PythonDriver};
use crate::error::{AttachError, ExecutionError, RunError, SnapshotError};
use crate::permission::PermissionGate;
use crate::session::{AttachSession, SessionState};
use crate::snapshot::{Snapshot, SnapshotWriter};
use crate::target::TargetProcess;
use config::Config;
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Success,
    PermissionDenied,
    AttachTimeout,
    AttachFailed,
    TargetExited,
    IntrospectionError,
    ExecutionTimeout,
    WriteFailed,
    Cancelled,
}

impl RunStatus {
    /// Process exit code the command line reports for this status.
    pub fn exit_code(self) -> u8 {
        match self {
            RunStatus::Success => 0,
            RunStatus::PermissionDenied => 2,
            RunStatus::AttachTimeout => 3,
            RunStatus::AttachFailed => 4,
            RunStatus::TargetExited => 5,
            RunStatus::IntrospectionError => 6,
            RunStatus::ExecutionTimeout => 7,
            RunStatus::WriteFailed => 8,
            RunStatus::Cancelled => 130,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PermissionDenied => "permission-denied",
            RunStatus::AttachTimeout => "attach-timeout",
            RunStatus::AttachFailed => "attach-failed",
            RunStatus::TargetExited => "target-exited",
            RunStatus::IntrospectionError => "introspection-error",
            RunStatus::ExecutionTimeout => "execution-timeout",
            RunStatus::WriteFailed => "write-failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub status: RunStatus,
    /// Present exactly when `status` is [`RunStatus::Success`].
    pub snapshot: Option<Snapshot>,
    /// Human-readable failure detail.
    pub message: Option<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    fn from_outcome(outcome: Result<Snapshot, RunError>) -> Self {
        match outcome {
            Ok(snapshot) => Self {
                status: RunStatus::Success,
                snapshot: Some(snapshot),
                message: None,
            },
            Err(err) => Self {
                status: err.status(),
                snapshot: None,
                message: Some(err.to_string()),
            },
        }
    }
}

/// The replaceable collaborators of a run.
pub struct Services {
    pub backends: Box<dyn BackendFactory>,
    pub driver: Box<dyn IntrospectionDriver>,
    pub clock: Box<dyn Clock>,
}

impl Services {
    /// GDB for debug control and the CPython driver.
    pub fn from_config(config: &Config) -> Self {
        Self {
            backends: Box::new(GdbFactory::from_config(config)),
            driver: Box::new(PythonDriver::new()),
            clock: Box::new(SystemClock),
        }
    }
}

enum Stop {
    Cancelled,
    Deadline,
}

pub struct RunController {
    config: Config,
    gate: PermissionGate,
    request: IntrospectionRequest,
    writer: SnapshotWriter,
    services: Services,
}

impl RunController {
    pub fn new(config: Config, services: Services) -> Self {
        Self {
            gate: PermissionGate::from_config(&config),
            request: IntrospectionRequest::from_config(&config.introspection),
            writer: SnapshotWriter::new(),
            config,
            services,
        }
    }

    pub fn with_request(mut self, request: IntrospectionRequest) -> Self {
        self.request = request;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Capture `pid` into `output`, finishing within `overall_timeout` plus
    /// the cleanup grace period.
    pub async fn run(&self, pid: i32, output: &Path, overall_timeout: Duration) -> RunResult {
        self.run_until(pid, output, overall_timeout, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), giving up early once `cancel` fires. The
    /// target is still detached before this returns.
    pub async fn run_until(
        &self,
        pid: i32,
        output: &Path,
        overall_timeout: Duration,
        cancel: &CancellationToken,
    ) -> RunResult {
        let started = Instant::now();
        info!(pid, output = %output.display(), ?overall_timeout, "capture started");

        let outcome = self
            .capture(pid, output, started + overall_timeout, overall_timeout, cancel)
            .await;
        let result = RunResult::from_outcome(outcome);

        match &result.message {
            None => info!(pid, status = %result.status, elapsed = ?started.elapsed(), "capture finished"),
            Some(message) => info!(
                pid,
                status = %result.status,
                elapsed = ?started.elapsed(),
                error = %message,
                "capture failed"
            ),
        }
        result
    }

    async fn capture(
        &self,
        pid: i32,
        output: &Path,
        deadline: Instant,
        overall_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Snapshot, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let level = self.gate.check_attach_allowed()?;
        debug!(pid, ?level, "host policy permits attach");
        let target = TargetProcess::lookup(pid)?;

        let backend = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            spawned = tokio::time::timeout_at(deadline, self.services.backends.spawn()) => match spawned {
                Ok(Ok(backend)) => backend,
                Ok(Err(err)) => return Err(AttachError::Backend { cause: err.to_string() }.into()),
                Err(_) => return Err(AttachError::Timeout { after: overall_timeout }.into()),
            },
        };

        let mut session = AttachSession::from_config(target, backend, &self.config);
        let stopped = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Stop::Cancelled),
            outcome = tokio::time::timeout_at(deadline, self.drive(&mut session, output, deadline)) => {
                outcome.map_err(|_| Stop::Deadline)
            }
        };
        let outcome = match stopped {
            Ok(outcome) => outcome,
            Err(Stop::Cancelled) => {
                info!(pid, state = ?session.state(), "capture cancelled");
                Err(RunError::Cancelled)
            }
            Err(Stop::Deadline) => Err(expired(session.state(), overall_timeout)),
        };

        if let Err(err) = session.detach().await {
            warn!(pid, %err, "cleanup incomplete");
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut AttachSession,
        output: &Path,
        deadline: Instant,
    ) -> Result<Snapshot, RunError> {
        session
            .attach(budget(self.config.attach.timeout, deadline))
            .await?;

        let structured = self
            .services
            .driver
            .execute(
                session,
                &self.request,
                budget(self.config.introspection.timeout, deadline),
            )
            .await?;

        let target = session.target();
        let snapshot = Snapshot::new(
            target.pid(),
            target.name(),
            self.services.clock.now(),
            structured,
        );
        self.writer
            .write(output, &snapshot, budget(Duration::MAX, deadline))
            .await?;
        Ok(snapshot)
    }
}

/// A stage gets its own limit or whatever is left of the run, whichever is
/// smaller.
fn budget(stage: Duration, deadline: Instant) -> Duration {
    stage.min(deadline.saturating_duration_since(Instant::now()))
}

/// Blame the overall deadline on the stage the session was in.
fn expired(state: SessionState, after: Duration) -> RunError {
    match state {
        SessionState::Detached | SessionState::Attaching => AttachError::Timeout { after }.into(),
        SessionState::Executing | SessionState::Failed => ExecutionError::Timeout { after }.into(),
        SessionState::Attached | SessionState::Detaching => SnapshotError::Timeout { after }.into(),
    }
}
