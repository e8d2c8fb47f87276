#![forbid(unsafe_code)]

//! [`IntrospectionDriver`] for CPython targets.
//!
//! The routine is staged in a private directory and started on a fresh
//! thread inside the target by one short inferior call made under the
//! interpreter lock. The target then runs normally while the routine walks
//! its heap, and the result is picked up once it has been renamed into
//! place. No inferior call is ever outstanding while we wait, so giving up
//! at the deadline leaves the target consistent.

use crate::backend::mi;
use crate::driver::{IntrospectionDriver, IntrospectionRequest, StructuredOutput};
use crate::error::ExecutionError;
use crate::session::AttachSession;
use crate::target::TargetProcess;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::unistd::{Uid, chown, geteuid};
use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, trace};

pub(crate) const OBJECT_CENSUS: &str = include_str!("object_census.py");
const BOOTSTRAP: &str = include_str!("bootstrap.py");

const BOOTSTRAP_FILE: &str = "bootstrap.py";
const ROUTINE_FILE: &str = "routine.py";
const PARAMS_FILE: &str = "params.json";
const RESULT_FILE: &str = "result.json";

#[derive(Debug, Clone, Default)]
pub struct PythonDriver;

impl PythonDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IntrospectionDriver for PythonDriver {
    async fn execute(
        &self,
        session: &mut AttachSession,
        request: &IntrospectionRequest,
        timeout: Duration,
    ) -> Result<StructuredOutput, ExecutionError> {
        let deadline = Instant::now() + timeout;
        let workdir =
            stage(session.target(), request).map_err(|err| ExecutionError::InjectionFailed {
                cause: format!("failed to stage routine: {err}"),
            })?;
        let launcher = launcher_source(&workdir.path().join(BOOTSTRAP_FILE))?;
        let result_path = workdir.path().join(RESULT_FILE);
        trace!(workdir = %workdir.path().display(), "routine staged");

        session.begin_execution()?;
        let outcome = match launch(session, &launcher, deadline).await {
            Ok(()) => {
                session
                    .run_until(deadline, || fs::read_to_string(&result_path).ok())
                    .await
            }
            Err(err) => Err(err),
        };
        session.end_execution();

        let output = StructuredOutput::parse(&outcome?, request.schema)?;
        debug!(
            pid = session.target().pid(),
            types = output.types.len(),
            objects = output.object_count(),
            "routine finished"
        );
        Ok(output)
    }
}

/// Start the bootstrap on its own thread inside the target.
async fn launch(
    session: &mut AttachSession,
    launcher: &str,
    deadline: Instant,
) -> Result<(), ExecutionError> {
    let gil = session
        .evaluate("(int) PyGILState_Ensure()", deadline)
        .await
        .map_err(context("cannot enter the Python interpreter"))?;
    let gil: i32 = gil
        .trim()
        .parse()
        .map_err(|_| ExecutionError::InjectionFailed {
            cause: format!("unexpected PyGILState_Ensure result {gil:?}"),
        })?;

    let status = session
        .evaluate(
            &format!("(int) PyRun_SimpleString({})", mi::quote(launcher)),
            deadline,
        )
        .await;
    // Released even when the launch failed.
    let released = session
        .evaluate(&format!("(void) PyGILState_Release({gil})"), deadline)
        .await;

    let status = status?;
    released?;
    if status.trim() != "0" {
        return Err(ExecutionError::InjectionFailed {
            cause: "routine bootstrap raised inside the target, see its stderr".to_owned(),
        });
    }
    Ok(())
}

fn context(what: &'static str) -> impl FnOnce(ExecutionError) -> ExecutionError {
    move |err| match err {
        ExecutionError::InjectionFailed { cause } => ExecutionError::InjectionFailed {
            cause: format!("{what}: {cause}"),
        },
        other => other,
    }
}

/// Write bootstrap, routine and parameters to a fresh private directory.
///
/// A target running as another user gets the directory handed over with
/// [`share_with`].
fn stage(target: &TargetProcess, request: &IntrospectionRequest) -> io::Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("memory-analyzer-")
        .permissions(Permissions::from_mode(0o700))
        .tempdir()?;
    fs::write(dir.path().join(BOOTSTRAP_FILE), BOOTSTRAP)?;
    fs::write(dir.path().join(ROUTINE_FILE), &request.routine)?;
    fs::write(
        dir.path().join(PARAMS_FILE),
        serde_json::to_vec(&request.params)?,
    )?;

    if target.owner_uid() != geteuid().as_raw() {
        share_with(dir.path(), Uid::from_raw(target.owner_uid()))?;
    }
    Ok(dir)
}

/// Let `owner` read the staged files and create its result in `dir`.
///
/// The directory is chowned to `owner` when we may do that. Otherwise it
/// becomes writable by everyone but sticky, so only we can replace the
/// staged files.
fn share_with(dir: &Path, owner: Uid) -> io::Result<()> {
    for file in [BOOTSTRAP_FILE, ROUTINE_FILE, PARAMS_FILE] {
        fs::set_permissions(dir.join(file), Permissions::from_mode(0o644))?;
    }
    match chown(dir, Some(owner), None) {
        Ok(()) => Ok(()),
        Err(Errno::EPERM) => {
            debug!(%owner, "cannot hand the staging directory over, sharing it instead");
            fs::set_permissions(dir, Permissions::from_mode(0o1733))
        }
        Err(err) => Err(err.into()),
    }
}

/// One line of Python that runs the bootstrap file.
fn launcher_source(bootstrap: &Path) -> Result<String, ExecutionError> {
    let path = bootstrap
        .to_str()
        .ok_or_else(|| ExecutionError::InjectionFailed {
            cause: format!("staging path {} is not UTF-8", bootstrap.display()),
        })?;
    // A JSON string is a valid Python string literal.
    let literal = serde_json::to_string(path).map_err(|err| ExecutionError::InjectionFailed {
        cause: err.to_string(),
    })?;
    Ok(format!(
        "exec(compile(open({literal}).read(), {literal}, 'exec'), \
         {{'__name__': '__memory_analyzer__', '__file__': {literal}}})"
    ))
}
