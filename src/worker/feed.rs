//! Where a worker takes jobs from and sends results to.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines};

use super::protocol::{self, FromWorker, ToWorker};
use crate::error::PoolError;
use crate::job::{Job, JobResult};
use crate::queue::{JobQueue, ResultSender};

/// A worker's view of the job and result queues.
#[async_trait]
pub trait WorkFeed: Send {
    /// The next job, or `None` once the worker should exit.
    async fn next_job(&mut self) -> Result<Option<Job>, PoolError>;

    /// Forward the result of an attempted job.
    async fn report(&mut self, result: JobResult) -> Result<(), PoolError>;
}

/// Direct access to the shared queues, for workers inside the supervisor.
pub struct LocalFeed {
    queue: Arc<JobQueue>,
    results: ResultSender,
}

impl LocalFeed {
    pub fn new(queue: Arc<JobQueue>, results: ResultSender) -> Self {
        Self { queue, results }
    }
}

#[async_trait]
impl WorkFeed for LocalFeed {
    async fn next_job(&mut self) -> Result<Option<Job>, PoolError> {
        // Empty on a sealed queue means exhausted, same as a stop pill.
        Ok(self.queue.try_take().into_job())
    }

    async fn report(&mut self, result: JobResult) -> Result<(), PoolError> {
        self.results
            .send(result)
            .map_err(|_| PoolError::ResultsClosed)
    }
}

/// Queue access over a JSON-lines pipe, for worker processes.
pub struct PipeFeed<R, W> {
    worker_id: usize,
    lines: Lines<BufReader<R>>,
    writer: W,
}

impl<R, W> PipeFeed<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(worker_id: usize, reader: R, writer: W) -> Self {
        Self {
            worker_id,
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub fn set_worker_id(&mut self, worker_id: usize) {
        self.worker_id = worker_id;
    }

    /// Read the next message, or `None` at end of input.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, PoolError> {
        match self.lines.next_line().await? {
            Some(line) => protocol::parse_message(self.worker_id, &line).map(Some),
            None => Ok(None),
        }
    }

    pub async fn send<T: Serialize + Sync>(&mut self, message: &T) -> Result<(), PoolError> {
        protocol::write_message(&mut self.writer, message).await
    }
}

#[async_trait]
impl<R, W> WorkFeed for PipeFeed<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn next_job(&mut self) -> Result<Option<Job>, PoolError> {
        self.send(&FromWorker::Ready).await?;
        match self.recv::<ToWorker>().await? {
            Some(ToWorker::Job { job }) => Ok(Some(job)),
            // Supervisor hung up: nothing more to do.
            Some(ToWorker::Shutdown) | None => Ok(None),
        }
    }

    async fn report(&mut self, result: JobResult) -> Result<(), PoolError> {
        self.send(&FromWorker::Finished { result }).await
    }
}
