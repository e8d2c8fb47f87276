#![allow(dead_code)]

use analyzer::{
    AttachSession, BackendError, BackendFactory, Clock, DebugBackend, ExecutionError,
    IntrospectionDriver, IntrospectionRequest, StructuredOutput,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Everything the fake backend was asked to do, in order.
#[derive(Debug, Clone, Default)]
pub struct Calls {
    calls: Arc<Mutex<Vec<&'static str>>>,
    expressions: Arc<Mutex<Vec<String>>>,
}

impl Calls {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn record_expression(&self, expression: &str) {
        self.expressions.lock().unwrap().push(expression.to_owned());
    }

    pub fn all(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    /// Expressions passed to evaluate, in order.
    pub fn expressions(&self) -> Vec<String> {
        self.expressions.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Step {
    #[default]
    Succeed,
    Hang,
    Deny,
    Vanish,
    Break,
}

impl Step {
    async fn play(self) -> Result<(), BackendError> {
        match self {
            Step::Succeed => Ok(()),
            Step::Hang => std::future::pending().await,
            Step::Deny => Err(BackendError::Denied("Operation not permitted".into())),
            Step::Vanish => Err(BackendError::NoSuchProcess),
            Step::Break => Err(BackendError::Command("scripted failure".into())),
        }
    }
}

/// What the target does once it is resumed.
#[derive(Debug, Clone, Default)]
pub enum OnResume {
    #[default]
    Idle,
    /// Write this as `result.json` next to the staged bootstrap, like the
    /// routine thread does.
    Publish(String),
    /// Kill the target.
    Die(i32),
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub attach: Step,
    pub attach_delay: Duration,
    pub evaluate: Step,
    /// Returned by every successful evaluate.
    pub value: String,
    /// Answers for the first evaluates, in order. `evaluate` and `value`
    /// apply once these run out.
    pub replies: Vec<(Step, &'static str)>,
    pub on_resume: OnResume,
    pub detach: Step,
}

pub struct FakeBackend {
    script: Script,
    calls: Calls,
    staged: Option<PathBuf>,
}

impl FakeBackend {
    pub fn new(script: Script, calls: Calls) -> Self {
        Self {
            script,
            calls,
            staged: None,
        }
    }
}

/// Directory of the bootstrap a launcher expression runs.
fn staged_dir(expression: &str) -> Option<PathBuf> {
    let end = expression.find("/bootstrap.py")?;
    let start = expression[..end].rfind('"')? + 1;
    Some(PathBuf::from(&expression[start..end]))
}

#[async_trait]
impl DebugBackend for FakeBackend {
    async fn attach(&mut self, _pid: i32) -> Result<(), BackendError> {
        self.calls.record("attach");
        tokio::time::sleep(self.script.attach_delay).await;
        self.script.attach.play().await
    }

    async fn evaluate(&mut self, expression: &str) -> Result<String, BackendError> {
        self.calls.record("evaluate");
        self.calls.record_expression(expression);
        if expression.contains("PyRun_SimpleString") {
            self.staged = staged_dir(expression);
        }
        if !self.script.replies.is_empty() {
            let (step, value) = self.script.replies.remove(0);
            step.play().await?;
            return Ok(value.to_owned());
        }
        self.script.evaluate.play().await?;
        Ok(self.script.value.clone())
    }

    async fn resume(&mut self) -> Result<(), BackendError> {
        self.calls.record("resume");
        match &self.script.on_resume {
            OnResume::Idle => {}
            OnResume::Publish(raw) => {
                let dir = self.staged.as_ref().expect("resumed before the launch");
                std::fs::write(dir.join("result.json"), raw).unwrap();
            }
            OnResume::Die(pid) => {
                nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(*pid),
                    nix::sys::signal::Signal::SIGKILL,
                )
                .unwrap();
            }
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), BackendError> {
        self.calls.record("pause");
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<(), BackendError> {
        self.calls.record("interrupt");
        Ok(())
    }

    async fn detach(&mut self) -> Result<(), BackendError> {
        self.calls.record("detach");
        self.script.detach.play().await
    }

    async fn shutdown(&mut self) {
        self.calls.record("shutdown");
    }
}

pub struct FakeFactory {
    pub script: Script,
    pub calls: Calls,
}

#[async_trait]
impl BackendFactory for FakeFactory {
    async fn spawn(&self) -> Result<Box<dyn DebugBackend>, BackendError> {
        self.calls.record("spawn");
        Ok(Box::new(FakeBackend::new(
            self.script.clone(),
            self.calls.clone(),
        )))
    }
}

/// Asks the backend for the routine's JSON in a single evaluate.
#[derive(Debug, Default)]
pub struct EchoDriver;

#[async_trait]
impl IntrospectionDriver for EchoDriver {
    async fn execute(
        &self,
        session: &mut AttachSession,
        request: &IntrospectionRequest,
        timeout: Duration,
    ) -> Result<StructuredOutput, ExecutionError> {
        session.begin_execution()?;
        let raw = session.evaluate("collect()", Instant::now() + timeout).await;
        session.end_execution();
        StructuredOutput::parse(&raw?, request.schema)
    }
}

pub struct FixedClock(pub SystemTime);

impl Default for FixedClock {
    fn default() -> Self {
        Self(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

pub const CENSUS_JSON: &str = r#"{
    "types": {
        "dict": {"count": 120, "total_bytes": 30720},
        "str": {"count": 900, "total_bytes": 54000},
        "myapp.Order": {"count": 7, "total_bytes": 392}
    },
    "samples": {"str": ["GET /health", "order-17"]}
}"#;

/// A disposable process to attach to. Killed and reaped on drop.
pub struct Sleeper(Child);

impl Sleeper {
    pub fn spawn() -> Self {
        Self(Command::new("sleep").arg("30").spawn().unwrap())
    }

    pub fn pid(&self) -> i32 {
        self.0.id() as i32
    }

    pub fn kill(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        self.kill();
    }
}
