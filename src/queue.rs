//! Job queue and result channel shared between the supervisor and workers.
//!
//! The queue is filled once, then sealed with one `Stop` item per worker.
//! Workers only ever call [`JobQueue::try_take`]; a `Stop` or an empty sealed
//! queue both mean "no more work", so there is no check-then-take race.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::QueueError;
use crate::job::{Job, JobResult};

/// Sending half of the result queue. One clone per worker.
pub type ResultSender = mpsc::UnboundedSender<JobResult>;
/// Receiving half of the result queue, drained by the supervisor.
pub type ResultReceiver = mpsc::UnboundedReceiver<JobResult>;

/// Create the result queue.
pub fn result_channel() -> (ResultSender, ResultReceiver) {
    mpsc::unbounded_channel()
}

/// An entry in the job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Job(Job),
    /// Poison pill: the worker that takes it exits.
    Stop,
}

/// Result of a non-blocking take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryTake {
    Job(Job),
    Stop,
    Empty,
}

impl TryTake {
    /// The job, if one was taken.
    pub fn into_job(self) -> Option<Job> {
        match self {
            Self::Job(job) => Some(job),
            Self::Stop | Self::Empty => None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<QueueItem>,
    sealed: bool,
}

/// FIFO of jobs with exactly-once take semantics.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    /// Create an empty, unsealed queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // The lock is never held across a panic-prone section.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a job. Fails once the queue has been sealed.
    pub fn push(&self, job: Job) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.sealed {
            return Err(QueueError::Sealed { job_id: job.id });
        }
        debug!(job_id = job.id, job = %job.descriptor, "Job enqueued");
        inner.items.push_back(QueueItem::Job(job));
        Ok(())
    }

    /// Append every job from an iterator, returning how many were added.
    pub fn extend<I>(&self, jobs: I) -> Result<usize, QueueError>
    where
        I: IntoIterator<Item = Job>,
    {
        let mut count = 0;
        for job in jobs {
            self.push(job)?;
            count += 1;
        }
        Ok(count)
    }

    /// Freeze the queue and append one stop marker per worker.
    pub fn seal(&self, workers: usize) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.sealed {
            return Err(QueueError::AlreadySealed);
        }
        inner.items.extend(std::iter::repeat_n(QueueItem::Stop, workers));
        inner.sealed = true;
        info!(
            jobs = inner.items.len() - workers,
            workers, "Job queue sealed"
        );
        Ok(())
    }

    /// Take the next item without blocking.
    pub fn try_take(&self) -> TryTake {
        match self.lock().items.pop_front() {
            Some(QueueItem::Job(job)) => TryTake::Job(job),
            Some(QueueItem::Stop) => TryTake::Stop,
            None => TryTake::Empty,
        }
    }

    /// Drop everything still queued. Returns the number of abandoned jobs.
    pub fn close(&self) -> usize {
        let mut inner = self.lock();
        inner.sealed = true;
        let abandoned = inner
            .items
            .drain(..)
            .filter(|item| matches!(item, QueueItem::Job(_)))
            .count();
        if abandoned > 0 {
            info!(abandoned, "Job queue closed with jobs still pending");
        }
        abandoned
    }

    /// Number of queued items, stop markers included.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Number of queued jobs, stop markers excluded.
    pub fn pending_jobs(&self) -> usize {
        self.lock()
            .items
            .iter()
            .filter(|item| matches!(item, QueueItem::Job(_)))
            .count()
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::job::JobDescriptor;

    fn job(id: u64) -> Job {
        Job::new(id, JobDescriptor::local(format!("/img/{id}.tif")))
    }

    #[test]
    fn fifo_order_then_stop_markers() {
        let queue = JobQueue::new();
        queue.extend((0..3).map(job)).unwrap();
        queue.seal(2).unwrap();

        assert_eq!(queue.len(), 5);
        assert_eq!(queue.pending_jobs(), 3);
        assert_eq!(queue.try_take(), TryTake::Job(job(0)));
        assert_eq!(queue.try_take(), TryTake::Job(job(1)));
        assert_eq!(queue.try_take(), TryTake::Job(job(2)));
        assert_eq!(queue.try_take(), TryTake::Stop);
        assert_eq!(queue.try_take(), TryTake::Stop);
        assert_eq!(queue.try_take(), TryTake::Empty);
        assert!(queue.is_empty());
    }

    #[test]
    fn sealed_queue_rejects_pushes() {
        let queue = JobQueue::new();
        queue.seal(1).unwrap();
        assert!(queue.is_sealed());
        assert!(matches!(
            queue.push(job(9)),
            Err(QueueError::Sealed { job_id: 9 })
        ));
        assert!(matches!(queue.seal(1), Err(QueueError::AlreadySealed)));
    }

    #[test]
    fn close_abandons_pending_jobs() {
        let queue = JobQueue::new();
        queue.extend((0..4).map(job)).unwrap();
        queue.seal(2).unwrap();
        queue.try_take();

        assert_eq!(queue.close(), 3);
        assert_eq!(queue.try_take(), TryTake::Empty);
        assert_eq!(queue.pending_jobs(), 0);
    }

    #[test]
    fn empty_queue_take_does_not_block() {
        let queue = JobQueue::new();
        assert_eq!(queue.try_take(), TryTake::Empty);
        assert_eq!(queue.try_take().into_job(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_takers_see_each_job_once() {
        const JOBS: u64 = 2_000;
        const TAKERS: usize = 8;

        let queue = JobQueue::new();
        queue.extend((0..JOBS).map(job)).unwrap();
        queue.seal(TAKERS).unwrap();

        let mut handles = Vec::new();
        for _ in 0..TAKERS {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                loop {
                    match queue.try_take() {
                        TryTake::Job(job) => taken.push(job.id),
                        TryTake::Stop | TryTake::Empty => break,
                    }
                    tokio::task::yield_now().await;
                }
                taken
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {id} taken twice");
            }
        }
        assert_eq!(seen.len() as u64, JOBS);
    }
}
