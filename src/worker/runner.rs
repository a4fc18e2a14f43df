//! The worker loop.
//!
//! Identical for every isolation mode: take a job, open a scoped catalog
//! session if the job is remote, hand the job to the processor, report the
//! outcome. A processor error never escapes the loop; it becomes a
//! `Failed` result and the failure policy decides whether to go on.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::feed::WorkFeed;
use crate::catalog::{Catalog, Credentials};
use crate::config::{Config, FailurePolicy};
use crate::error::{PoolError, ProcessError};
use crate::job::{Job, JobOutcome, JobResult, JobSummary};
use crate::keepalive::ScopedSession;
use crate::processor::{JobInput, Processor};

/// Everything a worker owns while it runs.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub config: Arc<Config>,
    pub processor: Arc<dyn Processor>,
    pub catalog: Arc<dyn Catalog>,
    pub credentials: Option<Credentials>,
}

/// What a worker did before exiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: usize,
    pub jobs_run: usize,
    pub failures: usize,
    /// Exited early because of `on_job_failure: exit_worker`.
    pub stopped_by_failure: bool,
}

/// Drain `feed` until it runs dry or the failure policy stops the worker.
pub async fn run_worker<F: WorkFeed>(
    ctx: &WorkerContext,
    feed: &mut F,
) -> Result<WorkerSummary, PoolError> {
    let worker_id = ctx.worker_id;
    let mut summary = WorkerSummary {
        worker_id,
        ..WorkerSummary::default()
    };
    info!(worker_id, "Worker started");

    while let Some(job) = feed.next_job().await? {
        let started_at = Utc::now();
        debug!(worker_id, job_id = job.id, image = %job.descriptor, "Processing job");

        let outcome = match run_job(ctx, &job).await {
            Ok(job_summary) => {
                info!(
                    worker_id,
                    job_id = job.id,
                    image = %job.descriptor,
                    token = %job_summary.token,
                    "Job completed"
                );
                JobOutcome::Completed {
                    summary: job_summary,
                }
            }
            Err(e) => {
                warn!(
                    worker_id,
                    job_id = job.id,
                    image = %job.descriptor,
                    error = %e,
                    "Job failed"
                );
                JobOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let failed = matches!(outcome, JobOutcome::Failed { .. });
        feed.report(JobResult {
            job_id: job.id,
            worker_id,
            descriptor: job.descriptor,
            outcome,
            started_at,
            finished_at: Utc::now(),
        })
        .await?;

        summary.jobs_run += 1;
        if failed {
            summary.failures += 1;
            if ctx.config.worker.on_job_failure == FailurePolicy::ExitWorker {
                warn!(worker_id, "Worker exiting after failed job");
                summary.stopped_by_failure = true;
                break;
            }
        }
    }

    info!(
        worker_id,
        jobs = summary.jobs_run,
        failures = summary.failures,
        "Worker finished"
    );
    Ok(summary)
}

/// Run one job, with a scoped catalog session for remote images.
async fn run_job(ctx: &WorkerContext, job: &Job) -> Result<JobSummary, ProcessError> {
    if !job.descriptor.is_remote() {
        return ctx
            .processor
            .process(JobInput {
                job,
                config: &ctx.config,
                session: None,
            })
            .await;
    }

    let credentials = ctx
        .credentials
        .as_ref()
        .ok_or(ProcessError::MissingCredentials)?;
    let scoped = ScopedSession::open(
        ctx.catalog.as_ref(),
        credentials,
        ctx.config.catalog.keepalive_interval(),
    )
    .await?;

    let result = ctx
        .processor
        .process(JobInput {
            job,
            config: &ctx.config,
            session: Some(scoped.session()),
        })
        .await;

    if let Err(e) = scoped.close().await {
        warn!(worker_id = ctx.worker_id, job_id = job.id, error = %e, "Failed to close job session");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::job::JobDescriptor;
    use crate::queue::{JobQueue, result_channel};
    use crate::catalog::MemoryCatalog;
    use crate::worker::feed::LocalFeed;

    /// Fails every job whose image name contains "bad"; records sessions seen.
    #[derive(Default)]
    struct Picky {
        saw_session: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Processor for Picky {
        async fn process(&self, input: JobInput<'_>) -> Result<JobSummary, ProcessError> {
            self.saw_session
                .lock()
                .unwrap()
                .push(input.session.is_some());
            if input.job.descriptor.image_name().contains("bad") {
                return Err(ProcessError::Other("segmentation failed".into()));
            }
            Ok(JobSummary::token(input.job.descriptor.image_name()))
        }
    }

    fn config(policy: &str) -> Arc<Config> {
        let yaml = format!(
            "input_pattern: '*.tif'\noutput_dir: o\noutput_refspot_dir: r\nnumber_of_workers: 1\n\
             worker:\n  on_job_failure: {policy}\n"
        );
        Arc::new(Config::from_yaml_str(&yaml).unwrap())
    }

    fn context(policy: &str, catalog: &MemoryCatalog, processor: Arc<Picky>) -> WorkerContext {
        WorkerContext {
            worker_id: 0,
            config: config(policy),
            processor,
            catalog: Arc::new(catalog.clone()),
            credentials: Some(catalog.credentials()),
        }
    }

    fn queue_of(names: &[&str]) -> Arc<JobQueue> {
        let queue = JobQueue::new();
        for (id, name) in (0u64..).zip(names) {
            queue.push(Job::new(id, JobDescriptor::local(*name))).unwrap();
        }
        queue.seal(1).unwrap();
        queue
    }

    #[tokio::test]
    async fn failures_are_reported_and_worker_continues() {
        let catalog = MemoryCatalog::default();
        let ctx = context("continue", &catalog, Arc::new(Picky::default()));
        let queue = queue_of(&["a.tif", "bad.tif", "c.tif"]);
        let (tx, mut rx) = result_channel();
        let mut feed = LocalFeed::new(queue, tx);

        let summary = run_worker(&ctx, &mut feed).await.unwrap();
        drop(feed);

        assert_eq!(summary.jobs_run, 3);
        assert_eq!(summary.failures, 1);
        assert!(!summary.stopped_by_failure);

        let mut outcomes = Vec::new();
        while let Some(result) = rx.recv().await {
            outcomes.push((result.job_id, result.is_completed()));
        }
        assert_eq!(outcomes, vec![(0, true), (1, false), (2, true)]);
    }

    #[tokio::test]
    async fn exit_worker_policy_stops_after_first_failure() {
        let catalog = MemoryCatalog::default();
        let ctx = context("exit_worker", &catalog, Arc::new(Picky::default()));
        let queue = queue_of(&["bad.tif", "b.tif", "c.tif"]);
        let (tx, mut rx) = result_channel();
        let mut feed = LocalFeed::new(Arc::clone(&queue), tx);

        let summary = run_worker(&ctx, &mut feed).await.unwrap();
        drop(feed);

        assert!(summary.stopped_by_failure);
        assert_eq!(summary.jobs_run, 1);
        assert_eq!(queue.pending_jobs(), 2);

        let result = rx.recv().await.unwrap();
        assert!(matches!(result.outcome, JobOutcome::Failed { ref error } if error.contains("segmentation")));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn remote_jobs_get_a_session_that_is_closed_afterwards() {
        let catalog = MemoryCatalog::default();
        let processor = Arc::new(Picky::default());
        let ctx = context("continue", &catalog, Arc::clone(&processor));
        let queue = JobQueue::new();
        queue.push(Job::new(0, JobDescriptor::remote("a.czi", 1))).unwrap();
        queue.push(Job::new(1, JobDescriptor::local("b.tif"))).unwrap();
        queue.seal(1).unwrap();
        let (tx, _rx) = result_channel();
        let mut feed = LocalFeed::new(queue, tx);

        run_worker(&ctx, &mut feed).await.unwrap();

        assert_eq!(*processor.saw_session.lock().unwrap(), vec![true, false]);
        assert_eq!(catalog.sessions_opened(), 1);
        assert_eq!(catalog.open_sessions(), 0);
    }

    #[tokio::test]
    async fn unreachable_catalog_fails_only_the_remote_job() {
        let catalog = MemoryCatalog::default().unreachable();
        let ctx = context("continue", &catalog, Arc::new(Picky::default()));
        let queue = JobQueue::new();
        queue.push(Job::new(0, JobDescriptor::remote("a.czi", 1))).unwrap();
        queue.push(Job::new(1, JobDescriptor::local("b.tif"))).unwrap();
        queue.seal(1).unwrap();
        let (tx, mut rx) = result_channel();
        let mut feed = LocalFeed::new(queue, tx);

        let summary = run_worker(&ctx, &mut feed).await.unwrap();
        assert_eq!(summary.failures, 1);
        assert!(!rx.recv().await.unwrap().is_completed());
        assert!(rx.recv().await.unwrap().is_completed());
    }
}
