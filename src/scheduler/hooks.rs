//! Notifications fired by the lifecycle controller.
//!
//! Hooks run after the transition has been persisted and outside of every
//! scheduler lock, so they may be slow but must not block on the scheduler.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::scheduler::job::{Job, JobStatus, JobType};

/// Counts of jobs per status.
///
/// Non-terminal counters reflect jobs currently active, terminal counters are
/// cumulative since the coordinator started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub just_created: u64,
    pub waiting: u64,
    pub processing: u64,
    pub successful: u64,
    pub failed: u64,
    pub crashed: u64,
}

impl Statistics {
    fn counter(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::JustCreated => &mut self.just_created,
            JobStatus::Waiting => &mut self.waiting,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Successful => &mut self.successful,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Crashed => &mut self.crashed,
        }
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::JustCreated => self.just_created,
            JobStatus::Waiting => self.waiting,
            JobStatus::Processing => self.processing,
            JobStatus::Successful => self.successful,
            JobStatus::Failed => self.failed,
            JobStatus::Crashed => self.crashed,
        }
    }

    pub(crate) fn record_new(&mut self, status: JobStatus) {
        *self.counter(status) += 1;
    }

    pub(crate) fn record_transition(&mut self, from: JobStatus, to: JobStatus) {
        let old = self.counter(from);
        *old = old.saturating_sub(1);
        *self.counter(to) += 1;
    }

    /// Jobs not yet finished.
    pub fn active(&self) -> u64 {
        self.just_created + self.waiting + self.processing
    }
}

pub trait JobHooks: Send + Sync {
    /// Any status or step change.
    fn job_updated(&self, _job: &Job, _stats: &Statistics) {}

    /// The job reached a terminal status.
    fn job_finished(&self, _job: &Job) {}

    /// A package build succeeded and the repository metadata should be
    /// regenerated.
    fn refresh_repository(&self, _job: &Job) {}
}

/// Hooks that only log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHooks;

impl JobHooks for TracingHooks {
    fn job_updated(&self, job: &Job, stats: &Statistics) {
        tracing::debug!(
            job_id = job.id,
            status = %job.status,
            active = stats.active(),
            "Job updated"
        );
    }

    fn job_finished(&self, job: &Job) {
        let elapsed = match (job.started, job.finished) {
            (Some(started), Some(finished)) => (finished - started).num_seconds(),
            _ => 0,
        };
        tracing::info!(
            job_id = job.id,
            job_target = %job.target,
            arch = %job.architecture,
            status = %job.status,
            elapsed_secs = elapsed,
            "Job finished"
        );
    }

    fn refresh_repository(&self, job: &Job) {
        tracing::info!(job_id = job.id, arch = %job.architecture, "Repository refresh requested");
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Updated { job: Job, stats: Statistics },
    Finished { job: Job },
    RefreshRepository { job: Job },
}

impl JobEvent {
    pub fn job(&self) -> &Job {
        match self {
            JobEvent::Updated { job, .. }
            | JobEvent::Finished { job }
            | JobEvent::RefreshRepository { job } => job,
        }
    }
}

/// Fans job events out to any number of subscribers, e.g. a live web
/// channel. Events are dropped when nobody listens.
#[derive(Debug, Clone)]
pub struct BroadcastHooks {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastHooks {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

impl JobHooks for BroadcastHooks {
    fn job_updated(&self, job: &Job, stats: &Statistics) {
        self.publish(JobEvent::Updated {
            job: job.clone(),
            stats: *stats,
        });
    }

    fn job_finished(&self, job: &Job) {
        self.publish(JobEvent::Finished { job: job.clone() });
    }

    fn refresh_repository(&self, job: &Job) {
        if job.job_type == JobType::Package {
            self.publish(JobEvent::RefreshRepository { job: job.clone() });
        }
    }
}
