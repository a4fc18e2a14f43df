//! A fixed set of workers draining one queue.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::Credentials;
use crate::error::PoolError;
use crate::queue::{JobQueue, ResultSender};
use crate::worker::{LaunchSpec, WorkerExit, WorkerHandle, WorkerLauncher, WorkerState};

/// Final state of one worker, as reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub state: WorkerState,
    pub exit: Option<WorkerExit>,
}

/// Handles to every launched worker.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Launch `workers` workers against a filled, sealed queue.
    ///
    /// If any launch fails, the workers already started are killed and the
    /// error is returned.
    pub fn launch(
        launcher: &dyn WorkerLauncher,
        workers: usize,
        queue: &Arc<JobQueue>,
        results: &ResultSender,
        credentials: Option<&Credentials>,
    ) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let spec = LaunchSpec {
                worker_id,
                queue: Arc::clone(queue),
                results: results.clone(),
                credentials: credentials.cloned(),
            };
            match launcher.launch(spec) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &mut handles {
                        handle.terminate();
                    }
                    return Err(e);
                }
            }
        }

        info!(workers, "Worker pool launched");
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Workers that have not been waited on yet.
    pub fn running(&self) -> usize {
        self.handles
            .iter()
            .filter(|h| h.state() == WorkerState::Running)
            .count()
    }

    /// Wait for every worker to exit.
    ///
    /// Safe to cancel and call again: exits already observed are kept.
    pub async fn join_all(&mut self) -> Vec<WorkerExit> {
        let exits =
            futures::future::join_all(self.handles.iter_mut().map(|handle| handle.wait())).await;

        for (worker_id, exit) in exits.iter().enumerate() {
            if let WorkerExit::Failed { reason } = exit {
                warn!(worker_id, %reason, "Worker failed");
            }
        }
        exits
    }

    /// Kill every worker still running. Returns how many were signalled.
    pub fn terminate_all(&mut self) -> usize {
        let signalled = self
            .handles
            .iter_mut()
            .map(WorkerHandle::terminate)
            .filter(|&signalled| signalled)
            .count();
        info!(signalled, "Terminating worker pool");
        signalled
    }

    pub fn reports(&self) -> Vec<WorkerReport> {
        self.handles
            .iter()
            .map(|h| WorkerReport {
                worker_id: h.worker_id(),
                state: h.state(),
                exit: h.exit().cloned(),
            })
            .collect()
    }
}
