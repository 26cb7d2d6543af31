use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::scheduler::job::{Job, JobStatus};

/// A job that has not reached a terminal status yet.
#[derive(Debug)]
pub struct ActiveJob {
    pub job: Job,
    /// Fired with the terminal status so the worker session owning the job
    /// can re-advertise its slot.
    completion: Option<oneshot::Sender<JobStatus>>,
}

impl ActiveJob {
    fn new(job: Job) -> Self {
        Self {
            job,
            completion: None,
        }
    }
}

/// In-memory set of every non-terminal job, keyed by id.
///
/// Ids are handed out by a monotonic sequence, so iterating the map visits
/// jobs in creation order.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<u64, ActiveJob>,
}

pub type SharedRegistry = Arc<Mutex<JobRegistry>>;

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Track a job. Returns false if a job with the same id is already known.
    pub fn insert(&mut self, job: Job) -> bool {
        if self.jobs.contains_key(&job.id) {
            return false;
        }
        self.jobs.insert(job.id, ActiveJob::new(job));
        true
    }

    pub fn contains(&self, id: u64) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Job> {
        self.jobs.get(&id).map(|active| &active.job)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Job> {
        self.jobs.get_mut(&id).map(|active| &mut active.job)
    }

    /// Stop tracking a job, handing back its completion signal if one was
    /// attached.
    pub fn remove(&mut self, id: u64) -> Option<(Job, Option<oneshot::Sender<JobStatus>>)> {
        self.jobs
            .remove(&id)
            .map(|active| (active.job, active.completion))
    }

    /// Record which worker holds the job and how to tell it the job is done.
    pub fn attach_completion(
        &mut self,
        id: u64,
        worker_id: u64,
        completion: oneshot::Sender<JobStatus>,
    ) -> bool {
        match self.jobs.get_mut(&id) {
            Some(active) => {
                active.job.assigned_worker = Some(worker_id);
                active.completion = Some(completion);
                true
            }
            None => false,
        }
    }

    /// Undo [`JobRegistry::attach_completion`] for the worker holding the
    /// job. Returns `None` if `worker_id` does not hold it, so a job is taken
    /// back at most once. The dropped sender wakes the session waiting on it.
    pub fn detach(&mut self, id: u64, worker_id: u64) -> Option<Job> {
        let active = self.jobs.get_mut(&id)?;
        if active.job.assigned_worker != Some(worker_id) {
            return None;
        }
        active.job.assigned_worker = None;
        active.completion = None;
        Some(active.job.clone())
    }

    pub fn jobs_for_worker(&self, worker_id: u64) -> Vec<&Job> {
        self.jobs
            .values()
            .map(|active| &active.job)
            .filter(|job| job.assigned_worker == Some(worker_id))
            .collect()
    }

    /// Active jobs building the given target.
    pub fn jobs_for_target(&self, target: &str) -> Vec<&Job> {
        self.jobs
            .values()
            .map(|active| &active.job)
            .filter(|job| job.target == target)
            .collect()
    }

    /// Copy of every active job, oldest first.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.values().map(|active| active.job.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
