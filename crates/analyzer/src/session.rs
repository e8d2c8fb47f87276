#![forbid(unsafe_code)]

//! Scoped debug control over one target process.
//!
//! ```text
//! Detached -> Attaching -> Attached <-> Executing
//!                 |           |             |
//!                 v           v             v
//!               Failed ---> Detaching ---> Detached
//! ```
//!
//! Every path that ever reached `Attaching` ends in `Detached` once
//! [`AttachSession::detach`] has run, whatever happened in between.

use crate::backend::DebugBackend;
use crate::error::{AttachError, BackendError, DetachError, ExecutionError};
use crate::target::{Liveness, TargetProcess};
use config::Config;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Detached,
    Attaching,
    Attached,
    Executing,
    Detaching,
    Failed,
}

/// What we know about the OS-level attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Released,
    /// An attach was started and never confirmed either way.
    Uncertain,
    Held,
}

pub struct AttachSession {
    target: TargetProcess,
    backend: Box<dyn DebugBackend>,
    state: SessionState,
    hold: Hold,
    target_gone: bool,
    /// An inferior call was started and never came back.
    call_in_flight: bool,
    attach_started: Option<Instant>,
    execution_started: Option<Instant>,
    poll_interval: Duration,
    cleanup_grace: Duration,
}

impl AttachSession {
    pub fn new(
        target: TargetProcess,
        backend: Box<dyn DebugBackend>,
        poll_interval: Duration,
        cleanup_grace: Duration,
    ) -> Self {
        Self {
            target,
            backend,
            state: SessionState::Detached,
            hold: Hold::Released,
            target_gone: false,
            call_in_flight: false,
            attach_started: None,
            execution_started: None,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            cleanup_grace,
        }
    }

    pub fn from_config(
        target: TargetProcess,
        backend: Box<dyn DebugBackend>,
        config: &Config,
    ) -> Self {
        Self::new(
            target,
            backend,
            config.attach.poll_interval,
            config.run.cleanup_grace,
        )
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> &TargetProcess {
        &self.target
    }

    /// When the current (or last) attach attempt began.
    pub fn attach_started(&self) -> Option<Instant> {
        self.attach_started
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Take debug control of the target, waiting at most `timeout`.
    pub async fn attach(&mut self, timeout: Duration) -> Result<(), AttachError> {
        let pid = self.target.pid();
        match self.state {
            SessionState::Detached => {}
            SessionState::Attached | SessionState::Executing => {
                return Err(AttachError::AlreadyAttached { pid });
            }
            state => {
                return Err(AttachError::Backend {
                    cause: format!("session is {state:?}, detach it before attaching again"),
                });
            }
        }
        if self.target_gone || self.target.liveness() == Liveness::Exited {
            self.target_gone = true;
            self.backend.shutdown().await;
            return Err(AttachError::TargetExited { pid });
        }
        if let Some(tracer) = self.target.tracer_pid() {
            self.state = SessionState::Failed;
            return Err(AttachError::Denied {
                cause: format!("process {pid} is already traced by process {tracer}"),
            });
        }

        let started = Instant::now();
        self.attach_started = Some(started);
        self.state = SessionState::Attaching;
        self.hold = Hold::Uncertain;
        debug!(pid, ?timeout, "attaching");

        let deadline = started + timeout;
        let outcome = race(
            &self.target,
            self.poll_interval,
            deadline,
            self.backend.attach(pid),
        )
        .await;

        match outcome {
            Some(Ok(())) => {
                self.state = SessionState::Attached;
                self.hold = Hold::Held;
                info!(pid, name = self.target.name(), elapsed = ?started.elapsed(), "attached");
                Ok(())
            }
            Some(Err(BackendError::NoSuchProcess | BackendError::TargetExited)) => {
                debug!(pid, "target exited during attach");
                self.target_gone = true;
                self.hold = Hold::Released;
                self.backend.shutdown().await;
                self.state = SessionState::Detached;
                Err(AttachError::TargetExited { pid })
            }
            Some(Err(BackendError::Denied(cause))) => {
                self.hold = Hold::Released;
                self.state = SessionState::Failed;
                Err(AttachError::Denied { cause })
            }
            Some(Err(err)) => {
                self.state = SessionState::Failed;
                Err(AttachError::Backend {
                    cause: err.to_string(),
                })
            }
            None => {
                warn!(pid, ?timeout, "attach timed out");
                self.state = SessionState::Failed;
                Err(AttachError::Timeout { after: timeout })
            }
        }
    }

    /// `Attached -> Executing`.
    pub fn begin_execution(&mut self) -> Result<(), ExecutionError> {
        let pid = self.target.pid();
        if self.target_gone {
            return Err(ExecutionError::TargetExited { pid });
        }
        if self.state != SessionState::Attached {
            return Err(ExecutionError::NotAttached);
        }
        if self.target.liveness() == Liveness::Exited {
            self.mark_target_gone();
            return Err(ExecutionError::TargetExited { pid });
        }
        self.state = SessionState::Executing;
        self.execution_started = Some(Instant::now());
        Ok(())
    }

    /// `Executing -> Attached`. Leaves any other state untouched so that a
    /// failure recorded during execution sticks.
    pub fn end_execution(&mut self) {
        if self.state == SessionState::Executing {
            self.state = SessionState::Attached;
        }
    }

    /// Evaluate an expression inside the stopped target.
    pub async fn evaluate(
        &mut self,
        expression: &str,
        deadline: Instant,
    ) -> Result<String, ExecutionError> {
        self.require_executing()?;
        self.call_in_flight = true;
        let outcome = race(
            &self.target,
            self.poll_interval,
            deadline,
            self.backend.evaluate(expression),
        )
        .await;
        if outcome.is_some() {
            self.call_in_flight = false;
        }
        self.settle(outcome)
    }

    /// Let the target run until `probe` yields a value, then stop it again.
    ///
    /// `probe` is checked once per poll interval. The target stays attached
    /// throughout, so an exit or the deadline is noticed just like during
    /// [`evaluate`](Self::evaluate).
    pub async fn run_until<T, F>(&mut self, deadline: Instant, mut probe: F) -> Result<T, ExecutionError>
    where
        F: FnMut() -> Option<T> + Send,
        T: Send,
    {
        self.require_executing()?;
        let resumed = race(
            &self.target,
            self.poll_interval,
            deadline,
            self.backend.resume(),
        )
        .await;
        self.settle(resumed)?;
        trace!(pid = self.target.pid(), "target resumed");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let value = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => return self.settle(None),
            }
            if let Some(value) = probe() {
                break value;
            }
            if self.target.liveness() == Liveness::Exited {
                return self.settle(Some(Err(BackendError::TargetExited)));
            }
        };

        let paused = race(
            &self.target,
            self.poll_interval,
            deadline,
            self.backend.pause(),
        )
        .await;
        self.settle(paused)?;
        Ok(value)
    }

    /// Release the target. Idempotent, and safe from every state.
    ///
    /// Cleanup is bounded by the cleanup grace period. The backend is always
    /// shut down afterwards, so the target is never left stopped even when
    /// the polite detach fails.
    pub async fn detach(&mut self) -> Result<(), DetachError> {
        if self.state == SessionState::Detached {
            return Ok(());
        }
        let pid = self.target.pid();
        let from = self.state;
        self.state = SessionState::Detaching;
        debug!(pid, ?from, "detaching");

        let mut result = Ok(());
        if self.target_gone || self.target.liveness() == Liveness::Exited {
            trace!(pid, "target gone, nothing to release");
        } else if self.hold != Hold::Released {
            if self.call_in_flight {
                debug!(pid, "interrupting unfinished inferior call");
                if let Err(err) = self.backend.interrupt().await {
                    warn!(pid, %err, "failed to interrupt inferior call");
                }
            }
            let detached = tokio::time::timeout(self.cleanup_grace, self.backend.detach()).await;
            result = match (detached, self.hold) {
                (Ok(Ok(())), _) => Ok(()),
                (Ok(Err(err)), Hold::Held) => Err(DetachError::Backend {
                    cause: err.to_string(),
                }),
                (Err(_), Hold::Held) => Err(DetachError::Timeout {
                    after: self.cleanup_grace,
                }),
                (outcome, _) => {
                    trace!(pid, ?outcome, "detach after an unconfirmed attach");
                    Ok(())
                }
            };
        }

        self.backend.shutdown().await;
        self.hold = Hold::Released;
        self.call_in_flight = false;
        self.execution_started = None;
        self.state = SessionState::Detached;
        match &result {
            Ok(()) => info!(pid, "detached"),
            Err(err) => warn!(pid, %err, "detach was not clean, debugger killed"),
        }
        result
    }

    fn require_executing(&self) -> Result<(), ExecutionError> {
        if self.target_gone {
            return Err(ExecutionError::TargetExited {
                pid: self.target.pid(),
            });
        }
        if self.state != SessionState::Executing {
            return Err(ExecutionError::NotAttached);
        }
        Ok(())
    }

    fn mark_target_gone(&mut self) {
        debug!(pid = self.target.pid(), "target exited while attached");
        self.target_gone = true;
        self.hold = Hold::Released;
        self.state = SessionState::Failed;
    }

    /// Map a raced backend outcome onto the session. `None` means the
    /// deadline passed first.
    fn settle<T>(&mut self, outcome: Option<Result<T, BackendError>>) -> Result<T, ExecutionError> {
        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(BackendError::TargetExited | BackendError::NoSuchProcess)) => {
                self.mark_target_gone();
                Err(ExecutionError::TargetExited {
                    pid: self.target.pid(),
                })
            }
            Some(Err(BackendError::Closed)) => {
                self.state = SessionState::Failed;
                Err(ExecutionError::InjectionFailed {
                    cause: "debugger exited unexpectedly".to_owned(),
                })
            }
            Some(Err(err)) => Err(ExecutionError::InjectionFailed {
                cause: err.to_string(),
            }),
            None => {
                let after = self
                    .execution_started
                    .map(|started| started.elapsed())
                    .unwrap_or_default();
                warn!(pid = self.target.pid(), ?after, "introspection timed out");
                self.state = SessionState::Failed;
                Err(ExecutionError::Timeout { after })
            }
        }
    }
}

impl Drop for AttachSession {
    fn drop(&mut self) {
        if self.state != SessionState::Detached {
            warn!(
                pid = self.target.pid(),
                state = ?self.state,
                "session dropped without detach, killing debugger"
            );
        }
    }
}

/// Run a backend operation until it finishes, the deadline passes or the
/// target exits. `None` means the deadline won.
async fn race<T>(
    target: &TargetProcess,
    poll_interval: Duration,
    deadline: Instant,
    operation: impl Future<Output = Result<T, BackendError>>,
) -> Option<Result<T, BackendError>> {
    tokio::select! {
        outcome = tokio::time::timeout_at(deadline, operation) => outcome.ok(),
        _ = target.exited(poll_interval) => Some(Err(BackendError::TargetExited)),
    }
}
