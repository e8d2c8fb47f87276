use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// memory-analyzer: heap snapshots of running processes
///
/// memory-analyzer attaches to a live process with the system debugger, runs
/// an introspection routine inside it and writes what the routine found to a
/// snapshot file. The target is released again before the tool exits, also
/// when the run fails or is interrupted.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/memory-analyzer/config.toml` and
    /// `/etc/memory-analyzer/config.d/*.toml`, where the latter being a glob
    /// pattern. If they don't exist, the default configuration is used.
    #[arg(short, long, global = true, value_parser = validate_file)]
    pub conffile: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// `-q` also silences the per-target success lines. Failures are always
    /// reported.
    pub fn quiet(&self) -> bool {
        matches!(
            self.verbosity.log_level_filter().as_str(),
            "OFF" | "ERROR"
        )
    }
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Capture a snapshot of one or more processes.
    Run(RunArgs),

    /// Check a snapshot file and summarise it.
    Verify(VerifyArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Where to write the snapshot.
    ///
    /// With more than one pid every target gets its own file, named by
    /// appending `.<pid>` to this path.
    #[arg(short, long)]
    pub file: PathBuf,

    /// Overall deadline per target in seconds, cleanup excluded.
    ///
    /// Overrides `run.overall_timeout_ms` from the configuration.
    #[arg(short, long, value_parser = parse_timeout)]
    pub timeout: Option<Duration>,

    /// Processes to inspect. They are captured concurrently.
    #[arg(required = true, value_parser = validate_pid)]
    pub pids: Vec<i32>,
}

impl RunArgs {
    /// Requested pids in order, without repeats.
    pub fn targets(&self) -> Vec<i32> {
        let mut seen = Vec::with_capacity(self.pids.len());
        for &pid in &self.pids {
            if !seen.contains(&pid) {
                seen.push(pid);
            }
        }
        seen
    }

    pub fn output_for(&self, pid: i32) -> PathBuf {
        if self.targets().len() == 1 {
            return self.file.clone();
        }
        let mut name = self.file.clone().into_os_string();
        name.push(format!(".{pid}"));
        PathBuf::from(name)
    }
}

#[derive(Debug, Args, Clone)]
pub struct VerifyArgs {
    /// Snapshot file to check.
    pub path: PathBuf,

    /// How many of the largest types to list.
    #[arg(short = 'n', long, default_value_t = 10)]
    pub top: usize,
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

#[inline(always)]
fn validate_pid(pid: &str) -> Result<i32, String> {
    let pid: i32 = pid
        .parse()
        .map_err(|_| format!("`{pid}` is not a valid pid"))?;
    if pid > 0 {
        Ok(pid)
    } else {
        Err("pid must be positive".to_string())
    }
}

/// Seconds, fractions allowed.
#[inline(always)]
fn parse_timeout(secs: &str) -> Result<Duration, String> {
    let secs: f64 = secs
        .parse()
        .map_err(|_| format!("`{secs}` is not a number of seconds"))?;
    if secs.is_nan() || secs <= 0.0 {
        return Err("timeout must be positive".to_string());
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(timeout) if timeout.is_zero() => Err("timeout must be positive".to_string()),
        Ok(timeout) => Ok(timeout),
        Err(_) => Err("timeout is too large".to_string()),
    }
}
