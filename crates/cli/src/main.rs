use analyzer::{RunController, RunStatus, Services, SnapshotReader};
use clap::Parser;
use config::Config;
use memory_analyzer::{
    cli::{Cli, Command, RunArgs, VerifyArgs},
    report,
    signals::wait_for_signal,
};
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Exit code for a snapshot file that does not verify.
const INVALID_SNAPSHOT: u8 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. `MEMORY_ANALYZER_LOG` can still set levels per crate,
    // e.g. `MEMORY_ANALYZER_LOG=analyzer::backend=trace memory-analyzer run ...`
    // shows the raw debugger conversation.
    let env_filter = EnvFilter::builder()
        .with_env_var("MEMORY_ANALYZER_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    let config = load_config(cli.conffile.as_deref())?;
    debug!(?config, ?cli);

    match &cli.command {
        Command::Run(args) => run(config, args, cli.quiet()).await,
        Command::Verify(args) => verify(args, cli.quiet()),
    }
}

fn load_config(conffile: Option<&Path>) -> anyhow::Result<Config> {
    let config = match conffile {
        Some(path) => Config::load(path)?,
        None => {
            let mut candidates = glob::glob("/etc/memory-analyzer/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.sort();
            candidates.insert(0, "/etc/memory-analyzer/config.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    Ok(config)
}

async fn run(config: Config, args: &RunArgs, quiet: bool) -> anyhow::Result<ExitCode> {
    let overall_timeout = args.timeout.unwrap_or(config.run.overall_timeout);
    let controller = RunController::new(config.clone(), Services::from_config(&config));

    // Signals cancel every capture; each one still detaches before returning.
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match wait_for_signal().await {
                Ok(event) => {
                    info!(?event, "cancelling captures");
                    cancel.cancel();
                }
                Err(err) => warn!(%err, "failed to install signal handlers"),
            }
        }
    });

    let captures = args.targets().into_iter().map(|pid| {
        let output = args.output_for(pid);
        let controller = &controller;
        let cancel = &cancel;
        async move {
            let result = controller
                .run_until(pid, &output, overall_timeout, cancel)
                .await;
            (pid, output, result)
        }
    });
    let results = futures::future::join_all(captures).await;
    watcher.abort();

    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    let mut status = RunStatus::Success;
    for (pid, output, result) in &results {
        let line = report::run_line(*pid, output, result);
        if result.is_success() {
            if !quiet {
                writeln!(stdout, "{line}")?;
            }
        } else {
            writeln!(stderr, "{line}")?;
            if status == RunStatus::Success {
                status = result.status;
            }
        }
    }
    Ok(ExitCode::from(status.exit_code()))
}

fn verify(args: &VerifyArgs, quiet: bool) -> anyhow::Result<ExitCode> {
    match SnapshotReader::read(&args.path) {
        Ok(snapshot) => {
            if !quiet {
                let mut stdout = io::stdout().lock();
                writeln!(stdout, "{}", report::snapshot_line(&args.path, &snapshot))?;
                for line in report::largest_types(&snapshot, args.top) {
                    writeln!(stdout, "{line}")?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            writeln!(io::stderr().lock(), "{}: {err}", args.path.display())?;
            Ok(ExitCode::from(INVALID_SNAPSHOT))
        }
    }
}
