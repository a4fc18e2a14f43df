use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use fishpool::catalog::{Catalog, Credentials, HttpCatalog};
use fishpool::config::{Config, DEFAULT_CONFIG_PATH, InputSource, WorkerMode};
use fishpool::processor::CommandProcessor;
use fishpool::source;
use fishpool::supervisor::Supervisor;
use fishpool::worker::process::run_child;
use fishpool::worker::{ProcessLauncher, TaskLauncher, WorkerLauncher};

/// Exit code for a run stopped by an interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "fishpool")]
#[command(version)]
#[command(about = "Fan out smFISH image analysis across a pool of workers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyse every image described by the configuration
    Run {
        /// Path to the YAML configuration
        ///
        /// Can also be set via FISHPOOL_CONFIG environment variable
        #[arg(short, long, env = "FISHPOOL_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override number_of_workers from the configuration
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        workers: Option<u64>,

        /// Run workers as tasks inside this process instead of child processes
        #[arg(long)]
        in_process: bool,
    },

    /// List the jobs a run would dispatch, without running them
    Jobs {
        /// Path to the YAML configuration
        #[arg(short, long, env = "FISHPOOL_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Worker process entry point (started by `run`)
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr: a worker's stdout carries the job protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Run {
            config,
            workers,
            in_process,
        } => run(&config, workers, in_process).await,
        Command::Jobs { config } => list_jobs(&config).await,
        Command::Worker => match run_child().await {
            Ok(_) => Ok(ExitCode::SUCCESS),
            Err(e) => Err(e.into()),
        },
    };

    outcome.unwrap_or_else(|e| {
        error!("{e:#}");
        ExitCode::FAILURE
    })
}

async fn run(path: &Path, workers: Option<u64>, in_process: bool) -> anyhow::Result<ExitCode> {
    let mut config = load_config(path)?;
    if let Some(workers) = workers {
        config.number_of_workers = usize::try_from(workers)?;
    }
    if in_process {
        config.worker.mode = WorkerMode::InProcess;
    }
    let config = Arc::new(config);

    // Fail before discovery if no analysis command is configured.
    let processor =
        CommandProcessor::from_config(&config).context("Invalid worker.analysis_command")?;
    // Prompt before the interrupt handler exists, so Ctrl-C at the prompt
    // still kills the process.
    let credentials = resolve_credentials(&config).await?;
    let catalog: Arc<dyn Catalog> = Arc::new(HttpCatalog::new(&config.catalog)?);
    let launcher: Arc<dyn WorkerLauncher> = match config.worker.mode {
        WorkerMode::Process => Arc::new(ProcessLauncher::new(Arc::clone(&config))?),
        WorkerMode::InProcess => Arc::new(TaskLauncher::new(
            Arc::clone(&config),
            Arc::new(processor),
            Arc::clone(&catalog),
        )),
    };

    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id);
    info!(
        parent: &span,
        config = %path.display(),
        workers = config.number_of_workers,
        mode = ?config.worker.mode,
        "Starting run"
    );

    let mut supervisor = Supervisor::new(config, catalog, launcher);
    if let Some(credentials) = credentials {
        supervisor = supervisor.with_credentials(credentials);
    }
    let report = supervisor
        .run(shutdown_signal())
        .instrument(span)
        .await?;

    eprintln!(
        "fishpool: {} completed, {} failed, {} abandoned",
        report.completed(),
        report.failed(),
        report.abandoned
    );

    if report.interrupted() {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn list_jobs(path: &Path) -> anyhow::Result<ExitCode> {
    let config = load_config(path)?;
    let catalog = HttpCatalog::new(&config.catalog)?;

    let credentials = resolve_credentials(&config).await?;

    let descriptors = source::enumerate(&config, &catalog, credentials.as_ref()).await?;
    for job in source::into_jobs(descriptors) {
        println!("{}\t{}", job.id, job.descriptor);
    }
    Ok(ExitCode::SUCCESS)
}

/// Catalog credentials for a remote source, from the environment or a prompt.
async fn resolve_credentials(config: &Config) -> anyhow::Result<Option<Credentials>> {
    match config.source() {
        InputSource::Remote { user, .. } => {
            let user = user.to_string();
            let credentials =
                tokio::task::spawn_blocking(move || Credentials::resolve(&user)).await??;
            Ok(Some(credentials))
        }
        InputSource::Local { .. } => Ok(None),
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Resolve on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT (Ctrl-C), stopping workers"),
        () = terminate => info!("Received SIGTERM, stopping workers"),
    }
}
