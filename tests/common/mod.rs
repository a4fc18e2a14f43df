//! Stub collaborators shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fishpool::config::Config;
use fishpool::error::{PoolError, ProcessError};
use fishpool::job::JobSummary;
use fishpool::processor::{JobInput, Processor};
use fishpool::worker::{LaunchSpec, WorkerHandle, WorkerLauncher};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Config for a local run over `<dir>/images/*.tif`.
pub fn local_config(dir: &Path, workers: usize, extra: &str) -> Config {
    let yaml = format!(
        "input_pattern: '{dir}/images/*.tif'\n\
         output_dir: '{dir}/out'\n\
         output_refspot_dir: '{dir}/out/refspots'\n\
         number_of_workers: {workers}\n\
         {extra}",
        dir = dir.display()
    );
    Config::from_yaml_str(&yaml).unwrap()
}

/// Config for a remote run over the given datasets.
pub fn remote_config(dir: &Path, workers: usize, datasets: &[i64]) -> Config {
    let yaml = format!(
        "OMERO_user: tester\n\
         OMERO_datasets: {datasets:?}\n\
         output_dir: '{dir}/out'\n\
         output_refspot_dir: '{dir}/out/refspots'\n\
         number_of_workers: {workers}\n",
        dir = dir.display()
    );
    Config::from_yaml_str(&yaml).unwrap()
}

/// Create `<dir>/images/<name>` for every name.
pub fn create_images(dir: &Path, names: &[&str]) {
    let images = dir.join("images");
    std::fs::create_dir_all(&images).unwrap();
    for name in names {
        std::fs::write(images.join(name), b"pixels").unwrap();
    }
}

/// Returns a fixed marker for every job; optionally sleeps and fails.
#[derive(Default)]
pub struct StubProcessor {
    delay: Duration,
    fail_on: Option<u64>,
    started: AtomicUsize,
    finished: AtomicUsize,
    seen: Mutex<Vec<u64>>,
}

impl StubProcessor {
    pub fn marker() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn failing_on(job_id: u64) -> Arc<Self> {
        Arc::new(Self {
            fail_on: Some(job_id),
            ..Self::default()
        })
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for StubProcessor {
    async fn process(&self, input: JobInput<'_>) -> Result<JobSummary, ProcessError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(input.job.id);

        if input.job.descriptor.is_remote() && input.session.is_none() {
            return Err(ProcessError::MissingSession { image_id: -1 });
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_on == Some(input.job.id) {
            return Err(ProcessError::Other(format!(
                "analysis crashed on job {}",
                input.job.id
            )));
        }

        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(JobSummary::token("marker"))
    }
}

/// Counts launches and delegates to another launcher.
pub struct CountingLauncher<L> {
    inner: L,
    launched: AtomicUsize,
}

impl<L: WorkerLauncher> CountingLauncher<L> {
    pub fn new(inner: L) -> Arc<Self> {
        Arc::new(Self {
            inner,
            launched: AtomicUsize::new(0),
        })
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

impl<L: WorkerLauncher> WorkerLauncher for CountingLauncher<L> {
    fn launch(&self, spec: LaunchSpec) -> Result<WorkerHandle, PoolError> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        self.inner.launch(spec)
    }
}
