//! Workers as tokio tasks inside the supervisor process.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::feed::LocalFeed;
use super::runner::{WorkerContext, WorkerSummary, run_worker};
use super::{LaunchSpec, WorkerControl, WorkerExit, WorkerHandle, WorkerLauncher};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::PoolError;
use crate::processor::Processor;

/// Launches each worker as a task sharing the queue directly.
#[derive(Clone)]
pub struct TaskLauncher {
    config: Arc<Config>,
    processor: Arc<dyn Processor>,
    catalog: Arc<dyn Catalog>,
}

impl TaskLauncher {
    pub fn new(
        config: Arc<Config>,
        processor: Arc<dyn Processor>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            config,
            processor,
            catalog,
        }
    }
}

impl WorkerLauncher for TaskLauncher {
    fn launch(&self, spec: LaunchSpec) -> Result<WorkerHandle, PoolError> {
        let ctx = WorkerContext {
            worker_id: spec.worker_id,
            config: Arc::clone(&self.config),
            processor: Arc::clone(&self.processor),
            catalog: Arc::clone(&self.catalog),
            credentials: spec.credentials,
        };
        let mut feed = LocalFeed::new(spec.queue, spec.results);

        let handle = tokio::spawn(async move { run_worker(&ctx, &mut feed).await });
        info!(worker_id = spec.worker_id, "Launched worker task");

        Ok(WorkerHandle::new(
            spec.worker_id,
            Box::new(TaskControl {
                worker_id: spec.worker_id,
                handle: Some(handle),
                exit: None,
            }),
        ))
    }
}

struct TaskControl {
    worker_id: usize,
    handle: Option<JoinHandle<Result<WorkerSummary, PoolError>>>,
    exit: Option<WorkerExit>,
}

#[async_trait]
impl WorkerControl for TaskControl {
    async fn wait(&mut self) -> WorkerExit {
        if let Some(handle) = self.handle.as_mut() {
            let exit = match handle.await {
                Ok(Ok(summary)) => WorkerExit::Finished { summary },
                Ok(Err(e)) => WorkerExit::Failed {
                    reason: e.to_string(),
                },
                Err(e) if e.is_cancelled() => WorkerExit::Killed,
                Err(e) => {
                    error!(worker_id = self.worker_id, error = %e, "Worker task panicked");
                    WorkerExit::Failed {
                        reason: format!("worker panicked: {e}"),
                    }
                }
            };
            self.handle = None;
            self.exit = Some(exit);
        }
        self.exit.clone().unwrap_or(WorkerExit::Killed)
    }

    fn terminate(&mut self) {
        if let Some(handle) = &self.handle
            && !handle.is_finished()
        {
            handle.abort();
            info!(worker_id = self.worker_id, "Aborted worker task");
        }
    }
}
