//! Workers as child processes.
//!
//! The supervisor re-executes its own binary with the hidden `worker`
//! subcommand. Each child runs in its own process group, so a terminal
//! interrupt reaches only the supervisor, and killing the group also kills
//! any analysis command the worker started. A proxy task per child answers
//! its `Ready` requests from the shared queue and forwards its results.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::feed::PipeFeed;
use super::protocol::{self, Bootstrap, FromWorker, ToWorker};
use super::runner::{WorkerContext, WorkerSummary, run_worker};
use super::{LaunchSpec, WorkerControl, WorkerExit, WorkerHandle, WorkerLauncher};
use crate::catalog::HttpCatalog;
use crate::config::Config;
use crate::error::PoolError;
use crate::processor::CommandProcessor;
use crate::queue::{JobQueue, ResultSender, TryTake};

/// Subcommand a worker process is started with.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Launches each worker as a child process of the current binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    config: Arc<Config>,
}

impl ProcessLauncher {
    /// Re-execute the running binary.
    pub fn new(config: Arc<Config>) -> Result<Self, PoolError> {
        Ok(Self::with_program(std::env::current_exe()?, config))
    }

    /// Use another binary that understands the `worker` subcommand.
    pub fn with_program(program: impl Into<PathBuf>, config: Arc<Config>) -> Self {
        Self {
            program: program.into(),
            args: vec![WORKER_SUBCOMMAND.to_string()],
            config,
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: LaunchSpec) -> Result<WorkerHandle, PoolError> {
        let worker_id = spec.worker_id;
        let launch_failed = |reason: String| PoolError::LaunchFailed { worker_id, reason };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| launch_failed(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_failed("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_failed("stdout not captured".into()))?;

        let bootstrap = Bootstrap {
            worker_id,
            config: (*self.config).clone(),
            credentials: spec.credentials.as_ref().map(Into::into),
        };
        let proxy = tokio::spawn(proxy(
            worker_id,
            stdin,
            stdout,
            bootstrap,
            spec.queue,
            spec.results,
        ));
        info!(worker_id, pid = child.id(), "Launched worker process");

        Ok(WorkerHandle::new(
            worker_id,
            Box::new(ProcessControl {
                worker_id,
                child,
                proxy: Some(proxy),
                proxy_outcome: None,
                killed: false,
            }),
        ))
    }
}

type ProxyResult = Result<Option<WorkerSummary>, PoolError>;

/// Serve one worker process until its stdout closes.
async fn proxy(
    worker_id: usize,
    stdin: ChildStdin,
    stdout: ChildStdout,
    bootstrap: Bootstrap,
    queue: Arc<JobQueue>,
    results: ResultSender,
) -> ProxyResult {
    let mut stdin = Some(stdin);
    if let Some(writer) = stdin.as_mut() {
        protocol::write_message(writer, &bootstrap).await?;
    }
    drop(bootstrap);

    let mut lines = BufReader::new(stdout).lines();
    let mut in_flight: Option<u64> = None;
    let mut summary = None;

    while let Some(line) = lines.next_line().await? {
        match protocol::parse_message::<FromWorker>(worker_id, &line)? {
            FromWorker::Ready => {
                let Some(writer) = stdin.as_mut() else {
                    return Err(PoolError::Protocol {
                        worker_id,
                        reason: "asked for work after shutdown".into(),
                    });
                };
                match queue.try_take() {
                    TryTake::Job(job) => {
                        debug!(worker_id, job_id = job.id, "Dispatching job to worker process");
                        in_flight = Some(job.id);
                        protocol::write_message(writer, &ToWorker::Job { job }).await?;
                    }
                    TryTake::Stop | TryTake::Empty => {
                        protocol::write_message(writer, &ToWorker::Shutdown).await?;
                        // Closing stdin leaves the worker nothing to block on.
                        stdin = None;
                    }
                }
            }
            FromWorker::Finished { result } => {
                in_flight = None;
                results.send(result).map_err(|_| PoolError::ResultsClosed)?;
            }
            FromWorker::Done { summary: done } => summary = Some(done),
        }
    }

    if let Some(job_id) = in_flight {
        warn!(worker_id, job_id, "Worker process exited mid-job, job lost");
    }
    Ok(summary)
}

struct ProcessControl {
    worker_id: usize,
    child: Child,
    proxy: Option<JoinHandle<ProxyResult>>,
    /// Summary or failure reason once the proxy has finished.
    proxy_outcome: Option<Result<Option<WorkerSummary>, String>>,
    killed: bool,
}

impl ProcessControl {
    fn kill_group(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // Safety: killpg takes no pointers. The child was spawned with
            // process_group(0), so its pid is also its process group id.
            let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                debug!(
                    worker_id = self.worker_id,
                    error = %std::io::Error::last_os_error(),
                    "killpg failed"
                );
            }
        }
        if let Err(e) = self.child.start_kill() {
            debug!(worker_id = self.worker_id, error = %e, "Worker process already gone");
        }
    }
}

#[async_trait]
impl WorkerControl for ProcessControl {
    async fn wait(&mut self) -> WorkerExit {
        if let Some(handle) = self.proxy.as_mut() {
            let outcome = match handle.await {
                Ok(Ok(summary)) => Ok(summary),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("proxy task ended: {e}")),
            };
            self.proxy = None;
            if let Err(reason) = &outcome
                && !self.killed
            {
                warn!(worker_id = self.worker_id, %reason, "Worker proxy failed, killing worker");
                self.kill_group();
            }
            self.proxy_outcome = Some(outcome);
        }

        let status = self.child.wait().await;
        if self.killed {
            return WorkerExit::Killed;
        }

        match (&self.proxy_outcome, status) {
            (Some(Err(reason)), _) => WorkerExit::Failed {
                reason: reason.clone(),
            },
            (Some(Ok(Some(summary))), Ok(status)) if status.success() => WorkerExit::Finished {
                summary: summary.clone(),
            },
            (_, Ok(status)) => WorkerExit::Failed {
                reason: format!("worker process exited with {status}"),
            },
            (_, Err(e)) => WorkerExit::Failed {
                reason: e.to_string(),
            },
        }
    }

    fn terminate(&mut self) {
        // An exited child only needs its wait; killing it would misreport it.
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(worker_id = self.worker_id, %status, "Worker process already exited");
            return;
        }
        self.killed = true;
        self.kill_group();
        if let Some(proxy) = &self.proxy {
            proxy.abort();
        }
        info!(worker_id = self.worker_id, "Killed worker process");
    }
}

/// Entry point of a worker process: read the bootstrap from stdin, then
/// drain jobs over stdin/stdout until told to stop.
pub async fn run_child() -> Result<WorkerSummary, PoolError> {
    let mut feed = PipeFeed::new(0, tokio::io::stdin(), tokio::io::stdout());

    let bootstrap = feed.recv::<Bootstrap>().await?.ok_or_else(|| PoolError::Protocol {
        worker_id: 0,
        reason: "stdin closed before bootstrap".into(),
    })?;
    let worker_id = bootstrap.worker_id;
    feed.set_worker_id(worker_id);

    let config = Arc::new(bootstrap.config);
    let failed = |reason: String| PoolError::WorkerFailed { worker_id, reason };
    let processor = CommandProcessor::from_config(&config).map_err(|e| failed(e.to_string()))?;
    let catalog = HttpCatalog::new(&config.catalog).map_err(|e| failed(e.to_string()))?;

    let ctx = WorkerContext {
        worker_id,
        config,
        processor: Arc::new(processor),
        catalog: Arc::new(catalog),
        credentials: bootstrap.credentials.map(Into::into),
    };

    let summary = run_worker(&ctx, &mut feed).await?;
    feed.send(&FromWorker::Done {
        summary: summary.clone(),
    })
    .await?;
    Ok(summary)
}
