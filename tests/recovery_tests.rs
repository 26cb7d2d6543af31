//! Restart recovery of undispatched jobs.


use std::sync::Arc;

use buildfarm::ledger::Ledger;
use buildfarm::scheduler::{Job, JobStatus, JobType, TracingHooks};
use tempfile::TempDir;
use test_harness::{next_dispatch, package, strings, test_config, TestFarm};

/// Write jobs straight into a ledger as a previous run would have left them.
fn seed(dir: &TempDir, statuses: &[JobStatus]) -> Vec<u64> {
    let ledger = Ledger::open(dir.path().join("ledger.redb")).unwrap();
    ledger.add_package(&package("foo", &["x86_64"])).unwrap();
    statuses
        .iter()
        .map(|status| {
            let id = ledger.next_job_id().unwrap();
            let mut job = Job::new(id, JobType::Package, "foo", "x86_64");
            job.status = *status;
            ledger.save_job(&job).unwrap();
            id
        })
        .collect()
}

async fn restart(dir: TempDir) -> TestFarm {
    let config = test_config(dir.path());
    TestFarm::start_in(dir, config, Arc::new(TracingHooks)).await
}

#[tokio::test]
async fn test_undispatched_jobs_are_requeued_once() {
    let dir = TempDir::new().unwrap();
    let ids = seed(
        &dir,
        &[
            JobStatus::Waiting,
            JobStatus::Successful,
            JobStatus::JustCreated,
            JobStatus::Processing,
        ],
    );

    let farm = restart(dir).await;
    let active: Vec<u64> = farm
        .coordinator
        .active_jobs()
        .await
        .iter()
        .map(|j| j.id)
        .collect();
    // Only the two jobs that never reached a worker come back
    assert_eq!(active, vec![ids[0], ids[2]]);

    let (worker, mut events) = farm
        .coordinator
        .subscribe("w1", &strings(&["package"]), &strings(&["x86_64"]))
        .await
        .unwrap();

    for expected in [ids[0], ids[2]] {
        let dispatch = next_dispatch(&mut events).await;
        assert_eq!(dispatch.job_id, expected);
        farm.coordinator
            .report_status(worker.id, expected, JobStatus::Processing)
            .await
            .unwrap();
        farm.coordinator
            .report_status(worker.id, expected, JobStatus::Successful)
            .await
            .unwrap();
    }

    let parked = farm.coordinator.router().parked_jobs().await;
    assert!(parked.is_empty(), "nothing dispatched twice: {:?}", parked);
}

#[tokio::test]
async fn test_job_ids_continue_after_restart() {
    let dir = TempDir::new().unwrap();
    let ids = seed(&dir, &[JobStatus::Successful, JobStatus::Failed]);

    let farm = restart(dir).await;
    let job = farm
        .coordinator
        .enqueue(JobType::Package, "foo", "x86_64")
        .await
        .unwrap();
    assert!(job.id > ids[1]);
    assert_eq!(farm.coordinator.ledger().last_job_id().unwrap(), job.id);
}

#[tokio::test]
async fn test_recovered_job_keeps_its_start_time() {
    let dir = TempDir::new().unwrap();
    let ids = seed(&dir, &[JobStatus::Waiting]);
    let started = {
        let ledger = Ledger::open(dir.path().join("ledger.redb")).unwrap();
        let mut job = ledger.get_job(ids[0]).unwrap().unwrap();
        job.started = Some(chrono::Utc::now() - chrono::Duration::minutes(5));
        ledger.save_job(&job).unwrap();
        job.started
    };

    let farm = restart(dir).await;
    let (_worker, mut events) = farm
        .coordinator
        .subscribe("w1", &strings(&["package"]), &strings(&["x86_64"]))
        .await
        .unwrap();
    assert_eq!(next_dispatch(&mut events).await.job_id, ids[0]);

    let stored = farm.coordinator.ledger().get_job(ids[0]).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.started, started);
}

#[tokio::test]
async fn test_start_time_is_stamped_at_enqueue() {
    let farm = TestFarm::start().await;
    farm.add_package("foo", &["x86_64"]);

    let job = farm
        .coordinator
        .enqueue(JobType::Package, "foo", "x86_64")
        .await
        .unwrap();
    assert!(job.started.is_some());
    assert_eq!(
        farm.coordinator.ledger().get_job(job.id).unwrap().unwrap().started,
        job.started
    );

    let (_worker, mut events) = farm
        .coordinator
        .subscribe("w1", &strings(&["package"]), &strings(&["x86_64"]))
        .await
        .unwrap();
    assert_eq!(next_dispatch(&mut events).await.job_id, job.id);

    // Claiming the job does not restamp it
    let stored = farm.coordinator.ledger().get_job(job.id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.started, job.started);
}

#[tokio::test]
async fn test_recovered_new_job_keeps_its_enqueue_time() {
    let dir = TempDir::new().unwrap();
    let ids = seed(&dir, &[JobStatus::JustCreated]);
    let started = {
        let ledger = Ledger::open(dir.path().join("ledger.redb")).unwrap();
        let mut job = ledger.get_job(ids[0]).unwrap().unwrap();
        job.started = Some(chrono::Utc::now() - chrono::Duration::hours(2));
        ledger.save_job(&job).unwrap();
        job.started
    };

    let farm = restart(dir).await;
    let (_worker, mut events) = farm
        .coordinator
        .subscribe("w1", &strings(&["package"]), &strings(&["x86_64"]))
        .await
        .unwrap();
    assert_eq!(next_dispatch(&mut events).await.job_id, ids[0]);

    let stored = farm.coordinator.ledger().get_job(ids[0]).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.started, started);
}
