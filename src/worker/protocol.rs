//! JSON-lines protocol between the supervisor and a worker process.
//!
//! The worker's stdin carries one [`Bootstrap`] line followed by
//! [`ToWorker`] messages; its stdout carries [`FromWorker`] messages. A
//! worker asks for work with `Ready` and is answered with a job or with
//! `Shutdown`, so jobs are only taken from the shared queue on demand.

use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::catalog::Credentials;
use crate::config::Config;
use crate::error::PoolError;
use crate::job::{Job, JobResult};
use crate::worker::runner::WorkerSummary;

/// First message sent to a worker process: everything it needs to run.
#[derive(Serialize, Deserialize)]
pub struct Bootstrap {
    pub worker_id: usize,
    pub config: Config,
    pub credentials: Option<WireCredentials>,
}

/// Credentials as sent over the worker's stdin.
#[derive(Serialize, Deserialize)]
pub struct WireCredentials {
    pub username: String,
    pub password: String,
}

impl From<&Credentials> for WireCredentials {
    fn from(credentials: &Credentials) -> Self {
        Self {
            username: credentials.username.clone(),
            password: credentials.password.expose_secret().to_string(),
        }
    }
}

impl From<WireCredentials> for Credentials {
    fn from(wire: WireCredentials) -> Self {
        Credentials::new(wire.username, wire.password)
    }
}

/// Supervisor → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToWorker {
    Job { job: Job },
    Shutdown,
}

/// Worker → supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FromWorker {
    /// Idle and asking for the next job.
    Ready,
    /// A job was attempted.
    Finished { result: JobResult },
    /// Last message before a clean exit.
    Done { summary: WorkerSummary },
}

/// Write one message as a JSON line and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), PoolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Parse one JSON line, attributing failures to `worker_id`.
pub fn parse_message<T: DeserializeOwned>(worker_id: usize, line: &str) -> Result<T, PoolError> {
    serde_json::from_str(line).map_err(|e| PoolError::Protocol {
        worker_id,
        reason: format!("{e} in line {line:?}"),
    })
}
