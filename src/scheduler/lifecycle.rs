//! Job lifecycle controller.
//!
//! Owns every status change. A change is written to the ledger first and only
//! then applied to the registry, so memory never gets ahead of disk. Worker
//! sessions are released only after the terminal status is on disk.
//!
//! Ledger writes run on the blocking pool while the registry lock is held;
//! the lock orders writes for the same job, the runtime threads stay free.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};

use crate::error::{BuildFarmError, Result};
use crate::ledger::Ledger;
use crate::scheduler::hooks::{JobHooks, Statistics};
use crate::scheduler::job::{Job, JobStatus, JobType, Step};
use crate::scheduler::registry::SharedRegistry;

pub struct LifecycleController {
    ledger: Ledger,
    registry: SharedRegistry,
    hooks: Arc<dyn JobHooks>,
    stats: Mutex<Statistics>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController").finish_non_exhaustive()
    }
}

impl LifecycleController {
    pub fn new(ledger: Ledger, registry: SharedRegistry, hooks: Arc<dyn JobHooks>) -> Self {
        Self {
            ledger,
            registry,
            hooks,
            stats: Mutex::new(Statistics::default()),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub async fn statistics(&self) -> Statistics {
        *self.stats.lock().await
    }

    /// Start tracking an already persisted job. Returns false if the job is
    /// tracked already.
    pub async fn admit(&self, job: Job) -> bool {
        let status = job.status;
        let id = job.id;
        if !self.registry.lock().await.insert(job) {
            tracing::debug!(job_id = id, "Job already tracked");
            return false;
        }
        self.stats.lock().await.record_new(status);
        true
    }

    /// Move a freshly queued job to `Waiting` and return it ready for
    /// routing. A job already waiting (recovered after a restart) is
    /// returned unchanged.
    pub async fn mark_waiting(&self, id: u64) -> Result<Job> {
        let updated = {
            let mut registry = self.registry.lock().await;
            let current = registry.get(id).ok_or(BuildFarmError::JobNotFound(id))?;
            match current.status {
                JobStatus::Waiting => return Ok(current.clone()),
                JobStatus::JustCreated => {}
                other => {
                    return Err(BuildFarmError::InvalidTransition {
                        id,
                        from: other,
                        to: JobStatus::Waiting,
                    })
                }
            }

            let mut updated = current.clone();
            updated.status = JobStatus::Waiting;
            // Stamped at enqueue; only records written without it get one here
            updated.started.get_or_insert_with(Utc::now);
            self.ledger.persist_job(&updated).await?;
            if let Some(job) = registry.get_mut(id) {
                *job = updated.clone();
            }
            updated
        };

        let stats = {
            let mut stats = self.stats.lock().await;
            stats.record_transition(JobStatus::JustCreated, JobStatus::Waiting);
            *stats
        };
        tracing::debug!(job_id = id, topic = %updated.topic(), "Job waiting for a worker");
        self.hooks.job_updated(&updated, &stats);
        Ok(updated)
    }

    /// Tie a dispatched job to the worker session that received it.
    /// `completion` fires with the terminal status.
    pub async fn assign(
        &self,
        id: u64,
        worker_id: u64,
        completion: oneshot::Sender<JobStatus>,
    ) -> bool {
        self.registry
            .lock()
            .await
            .attach_completion(id, worker_id, completion)
    }

    /// Take a job back from a worker that never started it. Only the
    /// first caller gets the job.
    pub async fn release(&self, id: u64, worker_id: u64) -> Option<Job> {
        self.registry.lock().await.detach(id, worker_id)
    }

    /// Apply a status reported for a job.
    ///
    /// Only forward moves are accepted. Terminal statuses persist the job,
    /// drop it from the registry, fire the hooks and finally release the
    /// worker session that holds it.
    pub async fn apply_status(&self, id: u64, status: JobStatus) -> Result<Job> {
        let (updated, from, completion) = {
            let mut registry = self.registry.lock().await;
            let current = registry.get(id).ok_or(BuildFarmError::JobNotFound(id))?;
            let from = current.status;
            if !from.can_advance_to(status) {
                return Err(BuildFarmError::InvalidTransition {
                    id,
                    from,
                    to: status,
                });
            }

            let mut updated = current.clone();
            updated.status = status;
            if status.is_terminal() {
                updated.finished = Some(Utc::now());
            }
            self.ledger.persist_job(&updated).await?;

            let completion = if status.is_terminal() {
                registry.remove(id).and_then(|(_, completion)| completion)
            } else {
                if let Some(job) = registry.get_mut(id) {
                    *job = updated.clone();
                }
                None
            };
            (updated, from, completion)
        };

        let stats = {
            let mut stats = self.stats.lock().await;
            stats.record_transition(from, status);
            *stats
        };
        tracing::info!(job_id = id, from = %from, status = %status, "Job status changed");

        self.hooks.job_updated(&updated, &stats);
        if status.is_terminal() {
            self.hooks.job_finished(&updated);
            if status == JobStatus::Successful && updated.job_type == JobType::Package {
                self.hooks.refresh_repository(&updated);
            }
            if let Some(completion) = completion {
                // The session may be gone already
                let _ = completion.send(status);
            }
        }
        Ok(updated)
    }

    /// Record a pipeline step reported by the worker.
    pub async fn record_step(&self, id: u64, step: Step) -> Result<()> {
        let updated = {
            let mut registry = self.registry.lock().await;
            let current = registry.get(id).ok_or(BuildFarmError::JobNotFound(id))?;
            let mut updated = current.clone();
            updated.upsert_step(step);
            self.ledger.persist_job(&updated).await?;
            if let Some(job) = registry.get_mut(id) {
                *job = updated.clone();
            }
            updated
        };
        let stats = self.statistics().await;
        self.hooks.job_updated(&updated, &stats);
        Ok(())
    }
}
