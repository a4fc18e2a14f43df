//! Worker system: isolated consumers of the job queue.
//!
//! Core components:
//! - `state`: worker and supervisor state machines
//! - `feed`: where a worker gets jobs from and sends results to
//! - `runner`: the worker loop shared by every isolation mode
//! - `task`: workers as tokio tasks inside the supervisor
//! - `process`: workers as child processes, brokered by a proxy task
//!
//! A launched worker is owned through a [`WorkerHandle`], which only exposes
//! `wait()` and `terminate()`. Workers never react to interrupts themselves.

pub mod feed;
pub mod process;
pub mod protocol;
pub mod runner;
pub mod state;
pub mod task;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::Credentials;
use crate::error::PoolError;
use crate::queue::{JobQueue, ResultSender};

pub use feed::{LocalFeed, PipeFeed, WorkFeed};
pub use process::ProcessLauncher;
pub use runner::{WorkerContext, WorkerSummary, run_worker};
pub use state::{RunState, SupervisorState, WorkerState};
pub use task::TaskLauncher;

/// What a launcher needs to start one worker.
pub struct LaunchSpec {
    pub worker_id: usize,
    pub queue: Arc<JobQueue>,
    pub results: ResultSender,
    /// Catalog credentials for remote jobs.
    pub credentials: Option<Credentials>,
}

/// Starts workers in some isolation mode.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: LaunchSpec) -> Result<WorkerHandle, PoolError>;
}

/// Low-level control over one running worker.
#[async_trait]
pub trait WorkerControl: Send {
    /// Wait for the worker to exit. Must be safe to call again after being
    /// cancelled.
    async fn wait(&mut self) -> WorkerExit;

    /// Kill the worker without waiting for it.
    fn terminate(&mut self);
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "exit", rename_all = "snake_case")]
pub enum WorkerExit {
    /// Drained its share of the queue, or stopped after a failed job.
    Finished { summary: WorkerSummary },
    /// Crashed or broke the worker protocol.
    Failed { reason: String },
    /// Killed by the supervisor.
    Killed,
}

/// Supervisor-side handle to a launched worker.
pub struct WorkerHandle {
    worker_id: usize,
    state: WorkerState,
    exit: Option<WorkerExit>,
    control: Box<dyn WorkerControl>,
}

impl WorkerHandle {
    pub fn new(worker_id: usize, control: Box<dyn WorkerControl>) -> Self {
        Self {
            worker_id,
            state: WorkerState::Running,
            exit: None,
            control,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn exit(&self) -> Option<&WorkerExit> {
        self.exit.as_ref()
    }

    /// Wait for the worker to exit and record how it ended.
    pub async fn wait(&mut self) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }

        let exit = self.control.wait().await;
        self.state = match exit {
            WorkerExit::Killed => WorkerState::Terminated,
            _ => WorkerState::Joined,
        };
        self.exit = Some(exit.clone());
        exit
    }

    /// Kill the worker if it is still running. Follow with [`Self::wait`].
    pub fn terminate(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        self.control.terminate();
        true
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("state", &self.state)
            .field("exit", &self.exit)
            .finish()
    }
}
