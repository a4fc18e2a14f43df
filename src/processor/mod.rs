//! The per-job processing collaborator.
//!
//! The engine treats processing as an opaque, potentially failing call. A
//! processor is invoked once per job and keeps no state between calls.

pub mod command;

use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::CatalogSession;
use crate::config::Config;
use crate::error::ProcessError;
use crate::job::{Job, JobSummary};

pub use command::CommandProcessor;

/// Everything a processor gets for one job.
#[derive(Clone, Copy)]
pub struct JobInput<'a> {
    pub job: &'a Job,
    pub config: &'a Config,
    /// Open catalog session, present for remote jobs only.
    pub session: Option<&'a Arc<dyn CatalogSession>>,
}

/// Runs the analysis for one job.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, input: JobInput<'_>) -> Result<JobSummary, ProcessError>;
}
