//! Run orchestration: discovery, dispatch, live result draining, shutdown.
//!
//! The supervisor is the only component that reacts to an interrupt. It is
//! handed a shutdown future; when that resolves it closes the queue, kills
//! every worker and waits for them before returning.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Credentials};
use crate::config::Config;
use crate::error::Result;
use crate::job::{JobDescriptor, JobResult};
use crate::pool::{WorkerPool, WorkerReport};
use crate::queue::{JobQueue, ResultReceiver, result_channel};
use crate::source;
use crate::worker::{RunState, SupervisorState, WorkerLauncher};

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: SupervisorState,
    /// Results received before the run ended or was interrupted.
    pub results: Vec<JobResult>,
    pub workers: Vec<WorkerReport>,
    /// Jobs never attempted: still queued at the interrupt, or left behind
    /// by workers that exited early.
    pub abandoned: usize,
    /// Results that arrived after the interrupt and were dropped.
    pub discarded: usize,
}

impl RunReport {
    fn empty(state: SupervisorState) -> Self {
        Self {
            state,
            results: Vec::new(),
            workers: Vec::new(),
            abandoned: 0,
            discarded: 0,
        }
    }

    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.completed()
    }

    pub fn interrupted(&self) -> bool {
        self.state == SupervisorState::Terminated
    }
}

enum Drain {
    Joined,
    Interrupted,
}

/// Owns one run from discovery to join or termination.
pub struct Supervisor {
    config: Arc<Config>,
    catalog: Arc<dyn Catalog>,
    launcher: Arc<dyn WorkerLauncher>,
    credentials: Option<Credentials>,
    run: RunState,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<dyn Catalog>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            config,
            catalog,
            launcher,
            credentials: None,
            run: RunState::new(),
        }
    }

    /// Catalog credentials for a remote run. The supervisor never prompts:
    /// a remote run without credentials fails discovery.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.run.current()
    }

    /// Run to completion, or until `shutdown` resolves.
    pub async fn run<S>(mut self, shutdown: S) -> Result<RunReport>
    where
        S: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);

        ensure_dirs(&self.config).await?;

        self.run.transition_to(SupervisorState::Discovering)?;
        let discovered = tokio::select! {
            biased;
            _ = &mut shutdown => None,
            discovered = self.discover() => Some(discovered),
        };
        let descriptors = match discovered {
            Some(Ok(descriptors)) => descriptors,
            Some(Err(e)) => {
                self.run.transition_to(SupervisorState::Terminated)?;
                return Err(e);
            }
            None => {
                info!("Interrupted during discovery");
                self.run.transition_to(SupervisorState::Terminated)?;
                return Ok(RunReport::empty(SupervisorState::Terminated));
            }
        };

        self.run.transition_to(SupervisorState::Dispatching)?;
        let workers = self.config.number_of_workers;
        let queue = JobQueue::new();
        let total = queue.extend(source::into_jobs(descriptors))?;
        queue.seal(workers)?;

        let (results_tx, results_rx) = result_channel();
        let pool = WorkerPool::launch(
            self.launcher.as_ref(),
            workers,
            &queue,
            &results_tx,
            self.credentials.as_ref(),
        );
        drop(results_tx);
        let pool = match pool {
            Ok(pool) => pool,
            Err(e) => {
                queue.close();
                self.run.transition_to(SupervisorState::Terminated)?;
                return Err(e.into());
            }
        };

        self.run.transition_to(SupervisorState::Running)?;
        info!(jobs = total, workers, "Dispatching jobs");

        self.drain(pool, queue, results_rx, shutdown).await
    }

    async fn discover(&self) -> Result<Vec<JobDescriptor>> {
        let descriptors = source::enumerate(
            &self.config,
            self.catalog.as_ref(),
            self.credentials.as_ref(),
        )
        .await?;
        Ok(descriptors)
    }

    async fn drain<S>(
        mut self,
        mut pool: WorkerPool,
        queue: Arc<JobQueue>,
        mut results_rx: ResultReceiver,
        mut shutdown: std::pin::Pin<&mut S>,
    ) -> Result<RunReport>
    where
        S: Future<Output = ()>,
    {
        let mut results = Vec::new();

        let drained = {
            let join = pool.join_all();
            tokio::pin!(join);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break Drain::Interrupted,
                    Some(result) = results_rx.recv() => {
                        log_result(&result);
                        results.push(result);
                    }
                    _ = &mut join => break Drain::Joined,
                }
            }
        };

        let mut report = match drained {
            Drain::Joined => {
                while let Ok(result) = results_rx.try_recv() {
                    log_result(&result);
                    results.push(result);
                }
                // Left behind by workers that stopped after a failure.
                let abandoned = queue.pending_jobs();
                if abandoned > 0 {
                    warn!(abandoned, "All workers exited with jobs still queued");
                }
                self.run.transition_to(SupervisorState::Joined)?;
                RunReport {
                    abandoned,
                    ..RunReport::empty(SupervisorState::Joined)
                }
            }
            Drain::Interrupted => {
                warn!("Interrupt received, terminating workers");
                let abandoned = queue.close();
                pool.terminate_all();
                pool.join_all().await;

                let mut discarded = 0;
                while results_rx.try_recv().is_ok() {
                    discarded += 1;
                }
                self.run.transition_to(SupervisorState::Terminated)?;
                RunReport {
                    abandoned,
                    discarded,
                    ..RunReport::empty(SupervisorState::Terminated)
                }
            }
        };

        report.results = results;
        report.workers = pool.reports();
        info!(
            state = %report.state,
            completed = report.completed(),
            failed = report.failed(),
            abandoned = report.abandoned,
            "Run finished"
        );
        Ok(report)
    }
}

/// Create the output directories. Existing directories are fine.
pub async fn ensure_dirs(config: &Config) -> Result<()> {
    for dir in [&config.output_dir, &config.output_refspot_dir] {
        tokio::fs::create_dir_all(dir).await?;
        debug!(path = %dir.display(), "Output directory ready");
    }
    Ok(())
}

fn log_result(result: &JobResult) {
    let elapsed_ms = result.elapsed().num_milliseconds();
    if result.is_completed() {
        info!(
            job_id = result.job_id,
            worker_id = result.worker_id,
            image = %result.descriptor,
            elapsed_ms,
            "Job finished"
        );
    } else {
        warn!(
            job_id = result.job_id,
            worker_id = result.worker_id,
            image = %result.descriptor,
            elapsed_ms,
            "Job did not complete"
        );
    }
}
