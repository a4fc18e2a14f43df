//! Job descriptors, jobs, and per-job results.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of work, as enumerated by the job source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobDescriptor {
    /// An image file on the local filesystem.
    LocalPath { path: PathBuf },
    /// An image held by the remote catalog, named after its imported source file.
    RemoteRef { filename: String, image_id: i64 },
}

impl JobDescriptor {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::LocalPath { path: path.into() }
    }

    pub fn remote(filename: impl Into<String>, image_id: i64) -> Self {
        Self::RemoteRef {
            filename: filename.into(),
            image_id,
        }
    }

    /// Base name used for every artifact derived from this image.
    pub fn image_name(&self) -> String {
        let path = match self {
            Self::LocalPath { path } => path.as_path(),
            Self::RemoteRef { filename, .. } => Path::new(filename),
        };
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteRef { .. })
    }
}

impl std::fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalPath { path } => write!(f, "{}", path.display()),
            Self::RemoteRef { filename, image_id } => write!(f, "{filename} (image {image_id})"),
        }
    }
}

/// A descriptor paired with its position in the enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub descriptor: JobDescriptor,
}

impl Job {
    pub fn new(id: u64, descriptor: JobDescriptor) -> Self {
        Self { id, descriptor }
    }
}

/// What the collaborator reported for a finished job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Free-form completion token returned by the collaborator.
    pub token: String,
    /// Artifacts the collaborator is known to have written.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

impl JobSummary {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            artifacts: Vec::new(),
        }
    }
}

/// Outcome of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { summary: JobSummary },
    Failed { error: String },
}

/// Record pushed to the result queue once a job has been attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: u64,
    pub worker_id: usize,
    pub descriptor: JobDescriptor,
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, JobOutcome::Completed { .. })
    }

    /// Wall-clock duration of the attempt.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
