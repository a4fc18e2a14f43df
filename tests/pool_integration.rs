//! End-to-end runs of the supervisor against stub collaborators.
//!
//! Most tests use in-process workers; the process-mode tests at the bottom
//! start the real binary as workers.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use fishpool::Error;
use fishpool::error::{CatalogError, DiscoveryError};
use fishpool::job::{JobDescriptor, JobOutcome};
use fishpool::supervisor::Supervisor;
use fishpool::worker::{SupervisorState, TaskLauncher, WorkerExit, WorkerState};

use fishpool::catalog::MemoryCatalog;

use common::{
    CountingLauncher, StubProcessor, TEST_TIMEOUT, create_images, local_config, remote_config,
};

fn task_launcher(
    config: &Arc<fishpool::config::Config>,
    processor: Arc<StubProcessor>,
    catalog: &MemoryCatalog,
) -> Arc<CountingLauncher<TaskLauncher>> {
    CountingLauncher::new(TaskLauncher::new(
        Arc::clone(config),
        processor,
        Arc::new(catalog.clone()),
    ))
}

#[tokio::test]
async fn local_run_collects_one_marker_per_file() {
    let dir = tempfile::tempdir().unwrap();
    create_images(dir.path(), &["a.tif", "b.tif", "c.tif", "notes.txt"]);
    let config = Arc::new(local_config(dir.path(), 2, ""));
    let catalog = MemoryCatalog::default();
    let launcher = task_launcher(&config, StubProcessor::marker(), &catalog);

    let report = timeout(
        TEST_TIMEOUT,
        Supervisor::new(config, Arc::new(catalog), launcher.clone())
            .run(std::future::pending::<()>()),
    )
    .await
    .expect("run timed out")
    .unwrap();

    assert_eq!(report.state, SupervisorState::Joined);
    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().all(|r| matches!(
        &r.outcome,
        JobOutcome::Completed { summary } if summary.token == "marker"
    )));
    assert_eq!(launcher.launched(), 2);
    assert_eq!(report.workers.len(), 2);
    assert!(report.workers.iter().all(|w| w.state == WorkerState::Joined));
    assert!(dir.path().join("out/refspots").is_dir());
}

#[tokio::test]
async fn no_matching_files_joins_immediately() {
    let dir = tempfile::tempdir().unwrap();
    create_images(dir.path(), &[]);
    let config = Arc::new(local_config(dir.path(), 2, ""));
    let catalog = MemoryCatalog::default();
    let processor = StubProcessor::marker();
    let launcher = task_launcher(&config, Arc::clone(&processor), &catalog);

    let report = timeout(
        TEST_TIMEOUT,
        Supervisor::new(config, Arc::new(catalog), launcher.clone())
            .run(std::future::pending::<()>()),
    )
    .await
    .expect("run timed out")
    .unwrap();

    assert_eq!(report.state, SupervisorState::Joined);
    assert!(report.results.is_empty());
    assert_eq!(launcher.launched(), 2);
    assert_eq!(processor.started(), 0);
    for worker in &report.workers {
        match &worker.exit {
            Some(WorkerExit::Finished { summary }) => assert_eq!(summary.jobs_run, 0),
            other => panic!("unexpected exit: {other:?}"),
        }
    }
}

#[tokio::test]
async fn remote_run_drains_every_image_sequentially() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = MemoryCatalog::default()
        .with_dataset(1, vec![(11, vec!["a1.czi"]), (12, vec!["a2.czi"])])
        .with_dataset(2, vec![(21, vec!["b1.czi"]), (22, vec!["b2.czi"])]);
    let config = Arc::new(remote_config(dir.path(), 1, &[1, 2]));
    let processor = StubProcessor::marker();
    let launcher = task_launcher(&config, Arc::clone(&processor), &catalog);

    let report = timeout(
        TEST_TIMEOUT,
        Supervisor::new(config, Arc::new(catalog.clone()), launcher)
            .with_credentials(catalog.credentials())
            .run(std::future::pending::<()>()),
    )
    .await
    .expect("run timed out")
    .unwrap();

    assert_eq!(report.state, SupervisorState::Joined);
    assert_eq!(report.completed(), 4);
    assert_eq!(processor.seen(), vec![0, 1, 2, 3]);
    assert_eq!(
        report.results[3].descriptor,
        JobDescriptor::remote("b2.czi", 22)
    );
    assert!(report.results.iter().all(|r| r.descriptor.is_remote()));

    // One discovery session plus one per job, all closed.
    assert_eq!(catalog.sessions_opened(), 5);
    assert_eq!(catalog.open_sessions(), 0);
}

#[tokio::test]
async fn discovery_failure_launches_no_workers() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = MemoryCatalog::default().rejecting_auth();
    let config = Arc::new(remote_config(dir.path(), 2, &[1]));
    let launcher = task_launcher(&config, StubProcessor::marker(), &catalog);

    let err = Supervisor::new(config, Arc::new(catalog.clone()), launcher.clone())
        .with_credentials(catalog.credentials())
        .run(std::future::pending::<()>())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Discovery(DiscoveryError::Catalog(CatalogError::AuthRejected { .. }))
    ));
    assert_eq!(launcher.launched(), 0);
}

#[tokio::test]
async fn missing_dataset_launches_no_workers() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = MemoryCatalog::default().with_dataset(1, vec![(11, vec!["a.czi"])]);
    let config = Arc::new(remote_config(dir.path(), 2, &[1, 7]));
    let launcher = task_launcher(&config, StubProcessor::marker(), &catalog);

    let err = Supervisor::new(config, Arc::new(catalog.clone()), launcher.clone())
        .with_credentials(catalog.credentials())
        .run(std::future::pending::<()>())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Discovery(_)));
    assert_eq!(launcher.launched(), 0);
    assert_eq!(catalog.open_sessions(), 0);
}

#[tokio::test]
async fn remote_run_without_credentials_never_prompts() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = MemoryCatalog::default().with_dataset(1, vec![(11, vec!["a.czi"])]);
    let config = Arc::new(remote_config(dir.path(), 2, &[1]));
    let launcher = task_launcher(&config, StubProcessor::marker(), &catalog);

    let err = timeout(
        TEST_TIMEOUT,
        Supervisor::new(config, Arc::new(catalog.clone()), launcher.clone())
            .run(std::future::pending::<()>()),
    )
    .await
    .expect("run timed out")
    .unwrap_err();

    assert!(matches!(
        err,
        Error::Discovery(DiscoveryError::MissingCredentials { ref user }) if user == "tester"
    ));
    assert_eq!(launcher.launched(), 0);
    assert_eq!(catalog.sessions_opened(), 0);
}

#[tokio::test]
async fn interrupt_terminates_every_worker() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..10).map(|i| format!("img{i:02}.tif")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    create_images(dir.path(), &names);

    let config = Arc::new(local_config(dir.path(), 4, ""));
    let catalog = MemoryCatalog::default();
    let processor = StubProcessor::slow(Duration::from_secs(1));
    let launcher = task_launcher(&config, Arc::clone(&processor), &catalog);

    let started = Instant::now();
    let report = timeout(
        TEST_TIMEOUT,
        Supervisor::new(config, Arc::new(catalog), launcher)
            .run(tokio::time::sleep(Duration::from_millis(200))),
    )
    .await
    .expect("run timed out")
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.state, SupervisorState::Terminated);
    assert!(report.interrupted());
    assert!(report.results.len() < 10);
    assert_eq!(report.abandoned + processor.started(), 10);
    assert_eq!(report.workers.len(), 4);
    assert!(
        report
            .workers
            .iter()
            .all(|w| w.state == WorkerState::Terminated)
    );

    // Aborted jobs never finish.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(processor.finished(), 0);
}

#[tokio::test]
async fn exit_worker_policy_loses_remaining_jobs_with_one_worker() {
    let dir = tempfile::tempdir().unwrap();
    create_images(dir.path(), &["1.tif", "2.tif", "3.tif", "4.tif", "5.tif"]);
    let config = Arc::new(local_config(
        dir.path(),
        1,
        "worker:\n  on_job_failure: exit_worker\n",
    ));
    let catalog = MemoryCatalog::default();
    let processor = StubProcessor::failing_on(2);
    let launcher = task_launcher(&config, Arc::clone(&processor), &catalog);

    let report = timeout(
        TEST_TIMEOUT,
        Supervisor::new(config, Arc::new(catalog), launcher).run(std::future::pending::<()>()),
    )
    .await
    .expect("run timed out")
    .unwrap();

    assert_eq!(report.state, SupervisorState::Joined);
    assert_eq!(processor.seen(), vec![0, 1, 2]);
    assert_eq!(report.abandoned, 2);
    assert_eq!(report.completed(), 2);
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        &report.results[2].outcome,
        JobOutcome::Failed { error } if error.contains("job 2")
    ));
    match &report.workers[0].exit {
        Some(WorkerExit::Finished { summary }) => assert!(summary.stopped_by_failure),
        other => panic!("unexpected exit: {other:?}"),
    }
}

#[tokio::test]
async fn continue_policy_isolates_failures_per_job() {
    let dir = tempfile::tempdir().unwrap();
    create_images(dir.path(), &["1.tif", "2.tif", "3.tif", "4.tif", "5.tif"]);
    let config = Arc::new(local_config(dir.path(), 1, ""));
    let catalog = MemoryCatalog::default();
    let processor = StubProcessor::failing_on(2);
    let launcher = task_launcher(&config, Arc::clone(&processor), &catalog);

    let report = timeout(
        TEST_TIMEOUT,
        Supervisor::new(config, Arc::new(catalog), launcher).run(std::future::pending::<()>()),
    )
    .await
    .expect("run timed out")
    .unwrap();

    assert_eq!(report.results.len(), 5);
    assert_eq!(report.completed(), 4);
    assert_eq!(report.failed(), 1);
}

#[cfg(unix)]
mod process_mode {
    use super::*;
    use fishpool::worker::ProcessLauncher;

    const BIN: &str = env!("CARGO_BIN_EXE_fishpool");

    #[tokio::test]
    async fn worker_processes_run_the_analysis_command() {
        let dir = tempfile::tempdir().unwrap();
        create_images(dir.path(), &["a.tif", "b.tif", "c.tif"]);
        let config = Arc::new(local_config(
            dir.path(),
            2,
            "worker:\n  analysis_command: [sh, -c, 'cat > \"$FISHPOOL_OUTPUT_DIR/$FISHPOOL_IMAGE_NAME.done\"']\n",
        ));
        let launcher = Arc::new(ProcessLauncher::with_program(BIN, Arc::clone(&config)));

        let report = timeout(
            TEST_TIMEOUT,
            Supervisor::new(config, Arc::new(MemoryCatalog::default()), launcher)
                .run(std::future::pending::<()>()),
        )
        .await
        .expect("run timed out")
        .unwrap();

        assert_eq!(report.state, SupervisorState::Joined);
        assert_eq!(report.completed(), 3);
        for name in ["a", "b", "c"] {
            let spec = std::fs::read_to_string(dir.path().join(format!("out/{name}.done"))).unwrap();
            assert!(spec.contains(&format!("\"image_name\":\"{name}\"")));
        }

        let jobs_run: usize = report
            .workers
            .iter()
            .map(|w| match &w.exit {
                Some(WorkerExit::Finished { summary }) => summary.jobs_run,
                other => panic!("unexpected exit: {other:?}"),
            })
            .sum();
        assert_eq!(jobs_run, 3);
    }

    #[tokio::test]
    async fn interrupt_kills_worker_processes() {
        let dir = tempfile::tempdir().unwrap();
        create_images(dir.path(), &["a.tif", "b.tif", "c.tif"]);
        let config = Arc::new(local_config(
            dir.path(),
            2,
            "worker:\n  analysis_command: [sleep, '30']\n",
        ));
        let launcher = Arc::new(ProcessLauncher::with_program(BIN, Arc::clone(&config)));

        let started = Instant::now();
        let report = timeout(
            TEST_TIMEOUT,
            Supervisor::new(config, Arc::new(MemoryCatalog::default()), launcher)
                .run(tokio::time::sleep(Duration::from_millis(1500))),
        )
        .await
        .expect("run timed out")
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.state, SupervisorState::Terminated);
        assert!(report.results.is_empty());
        assert!(
            report
                .workers
                .iter()
                .all(|w| w.state == WorkerState::Terminated)
        );
    }
}
