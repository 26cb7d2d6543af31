//! Job status transitions, persistence and hooks.


use std::sync::Arc;
use std::time::Duration;

use buildfarm::error::BuildFarmError;
use buildfarm::scheduler::{
    BroadcastHooks, Job, JobEvent, JobRegistry, JobStatus, JobType, LifecycleController, Step,
    TracingHooks,
};
use buildfarm::ledger::Ledger;
use tempfile::TempDir;
use test_harness::{next_dispatch, strings, test_config, TestFarm};
use tokio::sync::{broadcast, oneshot};

fn controller(dir: &TempDir) -> LifecycleController {
    let ledger = Ledger::open(dir.path().join("ledger.redb")).unwrap();
    LifecycleController::new(ledger, JobRegistry::shared(), Arc::new(TracingHooks))
}

async fn admitted(lifecycle: &LifecycleController, id: u64) -> Job {
    let job = Job::new(id, JobType::Package, "foo", "x86_64");
    lifecycle.ledger().save_job(&job).unwrap();
    assert!(lifecycle.admit(job.clone()).await);
    job
}

async fn next_event(rx: &mut broadcast::Receiver<JobEvent>) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within 2s")
        .unwrap()
}

#[tokio::test]
async fn test_status_only_moves_forward() {
    let dir = TempDir::new().unwrap();
    let lifecycle = controller(&dir);
    admitted(&lifecycle, 1).await;

    // No skipping straight to Processing
    let err = lifecycle
        .apply_status(1, JobStatus::Processing)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BuildFarmError::InvalidTransition {
            from: JobStatus::JustCreated,
            to: JobStatus::Processing,
            ..
        }
    ));

    lifecycle.mark_waiting(1).await.unwrap();
    lifecycle.apply_status(1, JobStatus::Processing).await.unwrap();

    let err = lifecycle
        .apply_status(1, JobStatus::Waiting)
        .await
        .unwrap_err();
    assert!(matches!(err, BuildFarmError::InvalidTransition { .. }));

    let done = lifecycle.apply_status(1, JobStatus::Failed).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.finished.is_some());

    // Terminal jobs leave the registry, so later updates find nothing
    let err = lifecycle
        .apply_status(1, JobStatus::Successful)
        .await
        .unwrap_err();
    assert!(matches!(err, BuildFarmError::JobNotFound(1)));
}

#[tokio::test]
async fn test_transitions_are_persisted() {
    let dir = TempDir::new().unwrap();
    let lifecycle = controller(&dir);
    admitted(&lifecycle, 7).await;

    let waiting = lifecycle.mark_waiting(7).await.unwrap();
    assert_eq!(waiting.status, JobStatus::Waiting);
    let stored = lifecycle.ledger().get_job(7).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.started, waiting.started);

    // Marking waiting twice is harmless
    let again = lifecycle.mark_waiting(7).await.unwrap();
    assert_eq!(again.started, waiting.started);

    lifecycle.apply_status(7, JobStatus::Processing).await.unwrap();
    lifecycle.apply_status(7, JobStatus::Successful).await.unwrap();
    let stored = lifecycle.ledger().get_job(7).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Successful);
    assert!(stored.finished.is_some());
    assert!(lifecycle.registry().lock().await.is_empty());
}

#[tokio::test]
async fn test_completion_fires_after_terminal_status_is_stored() {
    let dir = TempDir::new().unwrap();
    let lifecycle = controller(&dir);
    admitted(&lifecycle, 3).await;
    lifecycle.mark_waiting(3).await.unwrap();

    let (tx, rx) = oneshot::channel();
    assert!(lifecycle.assign(3, 42, tx).await);
    assert_eq!(
        lifecycle.registry().lock().await.get(3).unwrap().assigned_worker,
        Some(42)
    );

    lifecycle.apply_status(3, JobStatus::Processing).await.unwrap();
    lifecycle.apply_status(3, JobStatus::Crashed).await.unwrap();

    assert_eq!(rx.await.unwrap(), JobStatus::Crashed);
    let stored = lifecycle.ledger().get_job(3).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Crashed);
}

#[tokio::test]
async fn test_release_clears_assignment() {
    let dir = TempDir::new().unwrap();
    let lifecycle = controller(&dir);
    admitted(&lifecycle, 5).await;
    lifecycle.mark_waiting(5).await.unwrap();

    let (tx, rx) = oneshot::channel();
    lifecycle.assign(5, 9, tx).await;
    assert!(lifecycle.release(5, 4).await.is_none());
    let job = lifecycle.release(5, 9).await.unwrap();
    assert_eq!(job.assigned_worker, None);
    assert_eq!(job.status, JobStatus::Waiting);
    // The session's slot sees the sender dropped
    assert!(rx.await.is_err());
    assert!(lifecycle.release(5, 9).await.is_none());
}

#[tokio::test]
async fn test_steps_are_upserted_by_name() {
    let dir = TempDir::new().unwrap();
    let lifecycle = controller(&dir);
    admitted(&lifecycle, 2).await;

    let mut step = Step {
        name: "mock".to_string(),
        ..Default::default()
    };
    lifecycle.record_step(2, step.clone()).await.unwrap();
    step.logs.push(b"build ok".to_vec());
    lifecycle.record_step(2, step.clone()).await.unwrap();
    lifecycle
        .record_step(
            2,
            Step {
                name: "createrepo".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stored = lifecycle.ledger().get_job(2).unwrap().unwrap();
    assert_eq!(stored.steps.len(), 2);
    assert_eq!(stored.steps[0], step);
    assert_eq!(stored.steps[1].name, "createrepo");
}

#[tokio::test]
async fn test_statistics_track_transitions() {
    let dir = TempDir::new().unwrap();
    let lifecycle = controller(&dir);
    admitted(&lifecycle, 1).await;
    admitted(&lifecycle, 2).await;
    assert_eq!(lifecycle.statistics().await.just_created, 2);

    lifecycle.mark_waiting(1).await.unwrap();
    lifecycle.apply_status(1, JobStatus::Processing).await.unwrap();
    lifecycle.apply_status(1, JobStatus::Successful).await.unwrap();

    let stats = lifecycle.statistics().await;
    assert_eq!(stats.just_created, 1);
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.successful, 1);
    assert_eq!(stats.active(), 1);
}

#[tokio::test]
async fn test_hooks_see_every_change() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let hooks = BroadcastHooks::new(64);
    let mut rx = hooks.subscribe();
    let farm = TestFarm::start_in(dir, config, Arc::new(hooks.clone())).await;
    farm.add_package("foo", &["x86_64"]);

    let (worker, mut events) = farm
        .coordinator
        .subscribe("w1", &strings(&["package"]), &strings(&["x86_64"]))
        .await
        .unwrap();
    let job = farm
        .coordinator
        .enqueue(JobType::Package, "foo", "x86_64")
        .await
        .unwrap();
    next_dispatch(&mut events).await;

    match next_event(&mut rx).await {
        JobEvent::Updated { job: updated, stats } => {
            assert_eq!(updated.id, job.id);
            assert_eq!(updated.status, JobStatus::Waiting);
            assert_eq!(stats.waiting, 1);
        }
        other => panic!("unexpected event {:?}", other),
    }

    farm.coordinator
        .report_status(worker.id, job.id, JobStatus::Processing)
        .await
        .unwrap();
    farm.coordinator
        .report_status(worker.id, job.id, JobStatus::Successful)
        .await
        .unwrap();

    let processing = next_event(&mut rx).await;
    assert_eq!(processing.job().status, JobStatus::Processing);
    let successful = next_event(&mut rx).await;
    assert_eq!(successful.job().status, JobStatus::Successful);
    assert!(matches!(next_event(&mut rx).await, JobEvent::Finished { .. }));
    // Successful package builds ask for a repository refresh
    assert!(matches!(
        next_event(&mut rx).await,
        JobEvent::RefreshRepository { .. }
    ));
}

#[tokio::test]
async fn test_image_success_does_not_refresh_repository() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let hooks = BroadcastHooks::new(64);
    let mut rx = hooks.subscribe();
    let farm = TestFarm::start_in(dir, config, Arc::new(hooks.clone())).await;
    farm.add_image("workstation", &["x86_64"]);

    let (worker, mut events) = farm
        .coordinator
        .subscribe("w1", &strings(&["image"]), &strings(&["x86_64"]))
        .await
        .unwrap();
    let job = farm
        .coordinator
        .enqueue(JobType::Image, "workstation", "x86_64")
        .await
        .unwrap();
    next_dispatch(&mut events).await;
    farm.coordinator
        .report_status(worker.id, job.id, JobStatus::Processing)
        .await
        .unwrap();
    farm.coordinator
        .report_status(worker.id, job.id, JobStatus::Successful)
        .await
        .unwrap();

    let mut saw_finished = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        match event {
            JobEvent::Finished { .. } => saw_finished = true,
            JobEvent::RefreshRepository { .. } => panic!("image builds do not touch the repo"),
            JobEvent::Updated { .. } => {}
        }
    }
    assert!(saw_finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_transitions_all_reach_the_ledger() {
    let dir = TempDir::new().unwrap();
    let lifecycle = Arc::new(controller(&dir));
    for id in 1..=24 {
        admitted(&lifecycle, id).await;
    }

    let mut tasks = tokio::task::JoinSet::new();
    for id in 1..=24u64 {
        let lifecycle = lifecycle.clone();
        tasks.spawn(async move {
            lifecycle.mark_waiting(id).await.unwrap();
            lifecycle.apply_status(id, JobStatus::Processing).await.unwrap();
            let outcome = if id % 3 == 0 {
                JobStatus::Failed
            } else {
                JobStatus::Successful
            };
            lifecycle.apply_status(id, outcome).await.unwrap();
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    assert!(lifecycle.registry().lock().await.is_empty());
    let finished = lifecycle
        .ledger()
        .filter_jobs(|j| j.status.is_terminal())
        .unwrap();
    assert_eq!(finished.len(), 24);
    let stats = lifecycle.statistics().await;
    assert_eq!(stats.count(JobStatus::Failed), 8);
    assert_eq!(stats.count(JobStatus::Successful), 16);
    assert_eq!(stats.active(), 0);
}
