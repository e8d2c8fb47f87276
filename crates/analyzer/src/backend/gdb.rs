#![forbid(unsafe_code)]

//! [`DebugBackend`] driving a GNU debugger child over GDB/MI.
//!
//! GDB does the actual ptrace work: attach stops every thread of the
//! target, `-data-evaluate-expression` performs inferior function calls and
//! detach restores the target. One GDB process serves one session.

use crate::backend::mi::{self, Record, ResultClass, Results};
use crate::backend::{BackendFactory, DebugBackend};
use crate::error::BackendError;
use async_trait::async_trait;
use config::Config;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Applied before every attach. `unwindonsignal` makes an interrupted
/// inferior call restore the target's frame instead of leaving it
/// half-way through our code.
/// `mi-async` keeps the command channel open while a resumed target runs.
const SETTINGS: &[&str] = &[
    "-gdb-set mi-async on",
    "-gdb-set confirm off",
    "-gdb-set pagination off",
    "-gdb-set width 0",
    "-gdb-set unwindonsignal on",
    "-gdb-set unwind-on-terminating-exception on",
    "-gdb-set breakpoint pending off",
];

const EXIT_GRACE: Duration = Duration::from_millis(200);
const REAP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct GdbFactory {
    gdb_path: PathBuf,
}

impl GdbFactory {
    pub fn new(gdb_path: impl Into<PathBuf>) -> Self {
        Self {
            gdb_path: gdb_path.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.host.gdb_path)
    }
}

#[async_trait]
impl BackendFactory for GdbFactory {
    async fn spawn(&self) -> Result<Box<dyn DebugBackend>, BackendError> {
        Ok(Box::new(GdbBackend::spawn(&self.gdb_path).await?))
    }
}

pub struct GdbBackend {
    child: Child,
    stdin: ChildStdin,
    records: mpsc::Receiver<Record>,
    reader: JoinHandle<()>,
    next_token: u64,
    attached: bool,
    running: bool,
    target_exited: bool,
    closed: bool,
}

impl GdbBackend {
    pub async fn spawn(gdb_path: &Path) -> Result<Self, BackendError> {
        let mut child = Command::new(gdb_path)
            .args(["--interpreter=mi2", "--nx", "--quiet"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or(BackendError::Closed)?;
        let stdout = child.stdout.take().ok_or(BackendError::Closed)?;

        let (tx, records) = mpsc::channel(256);
        let reader = tokio::spawn(read_records(stdout, tx));

        let mut backend = Self {
            child,
            stdin,
            records,
            reader,
            next_token: 0,
            attached: false,
            running: false,
            target_exited: false,
            closed: false,
        };
        for setting in SETTINGS {
            if let Err(err) = backend.command(setting).await {
                backend.shutdown().await;
                return Err(err);
            }
        }
        debug!(gdb_pid = backend.child.id(), path = %gdb_path.display(), "gdb ready");
        Ok(backend)
    }

    /// Send one MI command and wait for its result record.
    ///
    /// Results carrying another token belong to commands whose caller gave
    /// up waiting; they are dropped here.
    async fn command(&mut self, command: &str) -> Result<Results, BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.next_token += 1;
        let token = self.next_token;
        trace!(token, command, "gdb <-");
        self.stdin
            .write_all(format!("{token}{command}\n").as_bytes())
            .await?;
        self.stdin.flush().await?;

        loop {
            match self.next_record().await? {
                Record::Result {
                    token: Some(seen),
                    class,
                    results,
                } if seen == token => return self.finish(class, results),
                record => self.dispatch(record),
            }
        }
    }

    async fn next_record(&mut self) -> Result<Record, BackendError> {
        match self.records.recv().await {
            Some(record) => Ok(record),
            None => {
                self.closed = true;
                Err(BackendError::Closed)
            }
        }
    }

    /// Handle a record nobody is waiting for.
    fn dispatch(&mut self, record: Record) {
        match record {
            Record::Result { token, class, .. } => {
                trace!(?token, %class, "discarding stale result");
            }
            Record::Async { class, results, .. } => self.observe(&class, &results),
            Record::Stream { kind, text } => {
                trace!(?kind, text = text.trim_end(), "gdb ->");
            }
            Record::Prompt => {}
        }
    }

    fn finish(&mut self, class: ResultClass, results: Results) -> Result<Results, BackendError> {
        match class {
            ResultClass::Done | ResultClass::Running | ResultClass::Connected => Ok(results),
            ResultClass::Exit => {
                self.closed = true;
                Err(BackendError::Closed)
            }
            ResultClass::Error => {
                let msg = results.get_str("msg").unwrap_or("unknown gdb error");
                Err(self.classify(msg))
            }
        }
    }

    fn observe(&mut self, class: &str, results: &Results) {
        match class {
            "thread-group-exited" => {
                debug!(exit_code = results.get_str("exit-code"), "inferior exited");
                self.target_exited = true;
                self.running = false;
            }
            "running" => self.running = true,
            "stopped" => {
                self.running = false;
                if results
                    .get_str("reason")
                    .is_some_and(|reason| reason.starts_with("exited"))
                {
                    self.target_exited = true;
                }
            }
            _ => trace!(class, "gdb async record"),
        }
    }

    fn classify(&self, msg: &str) -> BackendError {
        if msg.contains("No such process") {
            BackendError::NoSuchProcess
        } else if msg.contains("Operation not permitted") || msg.contains("Permission denied") {
            BackendError::Denied(msg.to_owned())
        } else if self.target_exited || msg.contains("exited while in a function called") {
            BackendError::TargetExited
        } else {
            BackendError::Command(msg.to_owned())
        }
    }
}

#[async_trait]
impl DebugBackend for GdbBackend {
    async fn attach(&mut self, pid: i32) -> Result<(), BackendError> {
        self.command(&format!("-target-attach {pid}")).await?;
        self.attached = true;
        Ok(())
    }

    async fn evaluate(&mut self, expression: &str) -> Result<String, BackendError> {
        if self.target_exited {
            return Err(BackendError::TargetExited);
        }
        let results = self
            .command(&format!("-data-evaluate-expression {}", mi::quote(expression)))
            .await?;
        Ok(results.get_str("value").unwrap_or_default().to_owned())
    }

    async fn resume(&mut self) -> Result<(), BackendError> {
        if self.target_exited {
            return Err(BackendError::TargetExited);
        }
        self.command("-exec-continue").await?;
        self.running = true;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), BackendError> {
        if !self.running {
            return Ok(());
        }
        self.command("-exec-interrupt").await?;
        // The `*stopped` record may trail the command's own result.
        while self.running {
            let record = self.next_record().await?;
            self.dispatch(record);
        }
        if self.target_exited {
            return Err(BackendError::TargetExited);
        }
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<(), BackendError> {
        let pid = self.child.id().ok_or(BackendError::Closed)?;
        kill(Pid::from_raw(pid as i32), Signal::SIGINT)
            .map_err(|err| BackendError::Io(err.into()))?;
        Ok(())
    }

    async fn detach(&mut self) -> Result<(), BackendError> {
        if !self.attached || self.target_exited {
            return Ok(());
        }
        match self.pause().await {
            Ok(()) => {}
            Err(BackendError::TargetExited) => return Ok(()),
            Err(err) => return Err(err),
        }
        self.command("-target-detach").await?;
        self.attached = false;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if !self.closed {
            let _ = tokio::time::timeout(EXIT_GRACE, self.command("-gdb-exit")).await;
            self.closed = true;
        }
        if let Err(err) = self.child.start_kill() {
            trace!(%err, "gdb already gone");
        }
        match tokio::time::timeout(REAP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => trace!(%status, "gdb reaped"),
            Ok(Err(err)) => warn!(%err, "failed to reap gdb"),
            Err(_) => warn!("gdb did not exit after SIGKILL"),
        }
        self.reader.abort();
    }
}

async fn read_records(stdout: ChildStdout, tx: mpsc::Sender<Record>) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                match mi::parse_record(&text) {
                    Ok(Record::Prompt) => {}
                    Ok(record) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => trace!(%err, line = %text.trim_end(), "skipping gdb output"),
                }
            }
            Err(err) => {
                warn!(%err, "failed to read gdb output");
                break;
            }
        }
    }
    trace!("gdb output closed");
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    fn gdb_available() -> bool {
        std::process::Command::new("gdb")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    #[tokio::test]
    async fn missing_gdb_binary_is_an_io_error() {
        let result = GdbBackend::spawn(Path::new("/nonexistent/gdb")).await;
        assert!(matches!(result, Err(BackendError::Io(_))));
    }

    #[tokio::test]
    async fn attach_to_missing_pid_reports_no_such_process() {
        if !gdb_available() {
            return;
        }
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        child.kill().unwrap();
        child.wait().unwrap();

        let mut backend = GdbBackend::spawn(Path::new("gdb")).await.unwrap();
        let result = backend.attach(pid).await;
        assert!(
            matches!(
                result,
                Err(BackendError::NoSuchProcess | BackendError::Denied(_))
            ),
            "unexpected result: {result:?}"
        );
        backend.shutdown().await;
        backend.shutdown().await;
    }
}
