use buildfarm::ledger::{Chroot, Ledger, LedgerError, VcsInfo};
use buildfarm::scheduler::{Job, JobStatus, JobType};
use tempfile::TempDir;

use test_harness::{image, package};

fn open(dir: &TempDir) -> Ledger {
    Ledger::open(dir.path().join("db").join("ledger.redb")).unwrap()
}

#[test]
fn test_open_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let ledger = open(&dir);
    assert!(dir.path().join("db").join("ledger.redb").exists());
    assert_eq!(ledger.job_count().unwrap(), 0);
    assert_eq!(ledger.last_job_id().unwrap(), 0);
    assert!(ledger.list_architectures().unwrap().is_empty());
}

#[test]
fn test_sequences_are_independent_and_monotonic() {
    let dir = TempDir::new().unwrap();
    let ledger = open(&dir);

    assert_eq!(ledger.next_job_id().unwrap(), 1);
    assert_eq!(ledger.next_job_id().unwrap(), 2);
    assert_eq!(ledger.next_worker_id().unwrap(), 1);
    assert_eq!(ledger.next_job_id().unwrap(), 3);
    assert_eq!(ledger.last_job_id().unwrap(), 3);
}

#[test]
fn test_sequences_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let ledger = open(&dir);
        ledger.next_job_id().unwrap();
        ledger.next_job_id().unwrap();
    }
    let ledger = open(&dir);
    assert_eq!(ledger.next_job_id().unwrap(), 3);
}

#[test]
fn test_jobs_round_trip_and_filter() {
    let dir = TempDir::new().unwrap();
    let ledger = open(&dir);

    for (id, status) in [
        (1, JobStatus::Successful),
        (2, JobStatus::Waiting),
        (3, JobStatus::JustCreated),
        (4, JobStatus::Processing),
    ] {
        let mut job = Job::new(id, JobType::Package, "foo", "x86_64");
        job.status = status;
        ledger.save_job(&job).unwrap();
    }

    let job = ledger.get_job(2).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.target, "foo");
    assert!(ledger.get_job(99).unwrap().is_none());

    let ids: Vec<u64> = ledger.list_jobs().unwrap().iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    let ids: Vec<u64> = ledger
        .undispatched_jobs()
        .unwrap()
        .iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(ids, vec![2, 3]);

    let failed = ledger
        .filter_jobs(|j| j.status.is_terminal())
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(ledger.job_count().unwrap(), 4);
}

#[test]
fn test_add_package_unions_architectures() {
    let dir = TempDir::new().unwrap();
    let ledger = open(&dir);

    ledger.add_package(&package("foo", &["x86_64"])).unwrap();
    let mut update = package("foo", &["aarch64", "x86_64"]);
    update.vcs = VcsInfo::new("https://git.example.org/forks/foo.git", "f40");
    let stored = ledger.add_package(&update).unwrap();

    assert_eq!(stored.architectures, vec!["x86_64", "aarch64"]);
    // Everything else is replaced
    assert_eq!(stored.vcs.branch, "f40");
    assert_eq!(ledger.get_package("foo").unwrap(), Some(stored.clone()));

    // Adding the same record again changes nothing
    let again = ledger.add_package(&update).unwrap();
    assert_eq!(again, stored);
    assert_eq!(ledger.list_packages().unwrap().len(), 1);
    assert_eq!(ledger.list_architectures().unwrap(), vec!["x86_64", "aarch64"]);
}

#[test]
fn test_remove_prunes_unreferenced_architectures() {
    let dir = TempDir::new().unwrap();
    let ledger = open(&dir);

    ledger.add_package(&package("foo", &["x86_64", "ppc64le"])).unwrap();
    ledger.add_image(&image("cloud", &["x86_64", "s390x"])).unwrap();
    assert_eq!(
        ledger.list_architectures().unwrap(),
        vec!["x86_64", "ppc64le", "s390x"]
    );

    ledger.remove_package("foo").unwrap();
    // x86_64 is still used by the image
    assert_eq!(ledger.list_architectures().unwrap(), vec!["x86_64", "s390x"]);
    assert!(!ledger.has_package("foo").unwrap());

    ledger.remove_image("cloud").unwrap();
    assert!(ledger.list_architectures().unwrap().is_empty());
}

#[test]
fn test_remove_unknown_target_is_not_found() {
    let dir = TempDir::new().unwrap();
    let ledger = open(&dir);

    let err = ledger.remove_package("ghost").unwrap_err();
    assert!(matches!(
        err,
        LedgerError::NotFound {
            collection: "package",
            ..
        }
    ));
    let err = ledger.remove_image("ghost").unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { collection: "image", .. }));
}

#[test]
fn test_images_keep_description() {
    let dir = TempDir::new().unwrap();
    let ledger = open(&dir);

    ledger.add_image(&image("workstation", &["x86_64"])).unwrap();
    let stored = ledger.get_image("workstation").unwrap().unwrap();
    assert_eq!(stored.description, "workstation image");
    assert!(ledger.has_image("workstation").unwrap());
    assert!(ledger.get_image("server").unwrap().is_none());
}

#[test]
fn test_chroots() {
    let dir = TempDir::new().unwrap();
    let ledger = open(&dir);

    ledger.add_chroot(&Chroot::new("fedora", "40", "x86_64")).unwrap();
    let mut epel = Chroot::new("epel", "9", "aarch64");
    epel.active = false;
    ledger.add_chroot(&epel).unwrap();

    assert_eq!(ledger.list_chroots().unwrap().len(), 2);
    let active = ledger.list_active_chroots().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name(), "fedora-40-x86_64");

    assert_eq!(
        ledger.get_chroot("epel", "9", "aarch64").unwrap(),
        Some(epel)
    );
    ledger.remove_chroot("epel", "9", "aarch64").unwrap();
    assert!(matches!(
        ledger.remove_chroot("epel", "9", "aarch64").unwrap_err(),
        LedgerError::NotFound { .. }
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn test_blocking_operations_leave_the_runtime_thread() {
    let dir = TempDir::new().unwrap();
    let ledger = open(&dir);
    let runtime_thread = std::thread::current().id();

    let (id, thread) = ledger
        .blocking(|ledger| Ok((ledger.next_job_id()?, std::thread::current().id())))
        .await
        .unwrap();
    assert_ne!(thread, runtime_thread);

    let job = Job::new(id, JobType::Image, "workstation", "aarch64");
    ledger.persist_job(&job).await.unwrap();
    assert_eq!(ledger.get_job(id).unwrap(), Some(job));
}
