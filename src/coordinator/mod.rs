//! Coordinator: the transport-independent core behind the RPC service.
//!
//! Owns the ledger, the job registry (through the lifecycle controller), the
//! topic router and the worker sessions.

pub mod sessions;

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::error::{BuildFarmError, Result};
use crate::ledger::{Image, Ledger, LedgerError, Package};
use crate::scheduler::{
    Dispatcher, Job, JobHooks, JobRegistry, JobStatus, JobType, LifecycleController,
    Statistics, Step, TopicRouter,
};
pub use sessions::{Dispatch, DispatchPayload, SessionEvent, SessionTable, WorkerSession};

/// Outbound buffer per worker stream.
const SESSION_BUFFER: usize = 16;

pub struct Coordinator {
    config: CoordinatorConfig,
    ledger: Ledger,
    lifecycle: Arc<LifecycleController>,
    router: Arc<TopicRouter>,
    sessions: SessionTable,
    queue: mpsc::Sender<u64>,
    /// Taken by [`Coordinator::start`].
    queue_rx: Mutex<Option<mpsc::Receiver<u64>>>,
}

impl Coordinator {
    /// Open the ledger named in the configuration.
    pub fn open(config: CoordinatorConfig, hooks: Arc<dyn JobHooks>) -> Result<Arc<Self>> {
        let ledger = Ledger::open(&config.database_path)?;
        Ok(Self::with_ledger(config, ledger, hooks))
    }

    pub fn with_ledger(
        config: CoordinatorConfig,
        ledger: Ledger,
        hooks: Arc<dyn JobHooks>,
    ) -> Arc<Self> {
        let (queue, queue_rx) = mpsc::channel(config.build.max_jobs.max(1));
        let lifecycle = Arc::new(LifecycleController::new(
            ledger.clone(),
            JobRegistry::shared(),
            hooks,
        ));
        Arc::new(Self {
            config,
            ledger,
            lifecycle,
            router: Arc::new(TopicRouter::new()),
            sessions: SessionTable::new(),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub async fn statistics(&self) -> Statistics {
        self.lifecycle.statistics().await
    }

    /// Start the dispatcher, then put every job left undispatched by a
    /// previous run back in line.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let queue_rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| BuildFarmError::Internal("coordinator already started".to_string()))?;

        let dispatcher = Dispatcher::new(queue_rx, self.lifecycle.clone(), self.router.clone());
        let handle = tokio::spawn(dispatcher.run(shutdown));

        let recovered = self.recover().await?;
        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered undispatched jobs");
        }
        Ok(handle)
    }

    /// Re-queue jobs persisted as `JustCreated` or `Waiting`, oldest first.
    async fn recover(&self) -> Result<usize> {
        let mut pending = self.ledger.undispatched_jobs()?;
        pending.sort_by_key(|job| job.id);

        let mut recovered = 0;
        for job in pending {
            let id = job.id;
            if !self.lifecycle.admit(job).await {
                continue;
            }
            self.queue
                .send(id)
                .await
                .map_err(|_| BuildFarmError::QueueClosed)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    // ----- jobs ---------------------------------------------------------------

    /// Check that a job for `target` on `arch` could be queued.
    pub fn check_target(&self, job_type: JobType, target: &str, arch: &str) -> Result<()> {
        if arch.trim().is_empty() {
            return Err(BuildFarmError::InvalidArgument(
                "architecture is required".to_string(),
            ));
        }
        let supported = match job_type {
            JobType::Package => self.ledger.get_package(target)?.map(|p| p.supports(arch)),
            JobType::Image => self.ledger.get_image(target)?.map(|i| i.supports(arch)),
        };
        match supported {
            None => Err(BuildFarmError::UnknownTarget {
                kind: job_type.as_str(),
                name: target.to_string(),
            }),
            Some(false) => Err(BuildFarmError::UnsupportedArchitecture {
                kind: job_type.as_str(),
                name: target.to_string(),
                arch: arch.to_string(),
            }),
            Some(true) => Ok(()),
        }
    }

    /// Create a job and put it in line. Waits while the new-work queue is
    /// full.
    pub async fn enqueue(&self, job_type: JobType, target: &str, arch: &str) -> Result<Job> {
        self.check_target(job_type, target, arch)?;
        if self.queue.is_closed() {
            return Err(BuildFarmError::QueueClosed);
        }

        let (owned_target, owned_arch) = (target.to_string(), arch.to_string());
        let job = self
            .ledger
            .blocking(move |ledger| {
                let mut job = Job::new(ledger.next_job_id()?, job_type, owned_target, owned_arch);
                job.started = Some(Utc::now());
                ledger.save_job(&job)?;
                Ok(job)
            })
            .await?;
        let id = job.id;
        self.lifecycle.admit(job.clone()).await;

        self.queue
            .send(id)
            .await
            .map_err(|_| BuildFarmError::QueueClosed)?;
        tracing::info!(job_id = id, job_target = %target, arch = %arch, job_type = %job_type, "Job queued");
        Ok(job)
    }

    /// Status update from a worker. The job must be held by that worker.
    pub async fn report_status(&self, worker_id: u64, job_id: u64, status: JobStatus) -> Result<Job> {
        self.ensure_owner(worker_id, job_id).await?;
        self.lifecycle.apply_status(job_id, status).await
    }

    pub async fn report_step(&self, worker_id: u64, job_id: u64, step: Step) -> Result<()> {
        self.ensure_owner(worker_id, job_id).await?;
        self.lifecycle.record_step(job_id, step).await
    }

    async fn ensure_owner(&self, worker_id: u64, job_id: u64) -> Result<()> {
        let registry = self.lifecycle.registry().lock().await;
        let job = registry
            .get(job_id)
            .ok_or(BuildFarmError::JobNotFound(job_id))?;
        if job.assigned_worker != Some(worker_id) {
            return Err(BuildFarmError::InvalidArgument(format!(
                "job #{} is not assigned to worker {}",
                job_id, worker_id
            )));
        }
        Ok(())
    }

    /// Active jobs, oldest first.
    pub async fn active_jobs(&self) -> Vec<Job> {
        self.lifecycle.registry().lock().await.snapshot()
    }

    // ----- workers ------------------------------------------------------------

    /// Register a worker and start one loop per topic it serves.
    ///
    /// The first event on the returned channel is
    /// [`SessionEvent::Subscribed`]; dispatches follow.
    pub async fn subscribe(
        self: &Arc<Self>,
        name: &str,
        types: &[String],
        architectures: &[String],
    ) -> Result<(Arc<WorkerSession>, mpsc::Receiver<SessionEvent>)> {
        if name.trim().is_empty() {
            return Err(BuildFarmError::InvalidArgument(
                "worker name is required".to_string(),
            ));
        }
        if types.is_empty() || architectures.is_empty() {
            return Err(BuildFarmError::InvalidArgument(
                "worker must declare at least one type and one architecture".to_string(),
            ));
        }
        let mut job_types = Vec::with_capacity(types.len());
        for t in types {
            let parsed: JobType = t.parse()?;
            if !job_types.contains(&parsed) {
                job_types.push(parsed);
            }
        }
        let mut archs: Vec<String> = Vec::with_capacity(architectures.len());
        for arch in architectures {
            if arch.trim().is_empty() {
                return Err(BuildFarmError::InvalidArgument(
                    "empty architecture".to_string(),
                ));
            }
            if !archs.contains(arch) {
                archs.push(arch.clone());
            }
        }

        let id = self
            .ledger
            .blocking(|ledger| ledger.next_worker_id())
            .await?;
        let worker = Arc::new(WorkerSession::new(id, name.to_string(), job_types, archs));
        self.sessions
            .register(worker.clone(), self.config.build.max_workers)
            .await?;

        let topics = worker.topics();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER.max(topics.len() + 1));
        tx.send(SessionEvent::Subscribed {
            id,
            images_dir: self.config.storage.images_dir.clone(),
            repository_url: self.config.storage.repository_url.clone(),
        })
        .await
        .map_err(|_| BuildFarmError::Internal("subscription stream closed".to_string()))?;

        for topic in &topics {
            tokio::spawn(self.clone().serve_topic(worker.clone(), topic.clone(), tx.clone()));
        }

        tracing::info!(
            worker = %worker.name,
            worker_id = id,
            topics = ?topics.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            "Worker subscribed"
        );
        Ok((worker, rx))
    }

    /// Stop handing jobs to a worker. Jobs in flight are left to finish.
    pub async fn unsubscribe(&self, worker_id: u64) -> Result<()> {
        let worker = self
            .sessions
            .get(worker_id)
            .await
            .ok_or(BuildFarmError::WorkerNotFound(worker_id))?;
        if worker.is_subscribed() {
            worker.stop();
            tracing::info!(worker = %worker.name, worker_id, "Worker unsubscribed");
        }
        Ok(())
    }

    // ----- catalog ------------------------------------------------------------

    pub fn add_package(&self, pkg: &Package) -> Result<Package> {
        pkg.validate()?;
        let stored = self.ledger.add_package(pkg)?;
        tracing::info!(package = %stored.name, archs = ?stored.architectures, "Package saved");
        Ok(stored)
    }

    pub async fn remove_package(&self, name: &str) -> Result<()> {
        self.ensure_idle(JobType::Package, name).await?;
        self.ledger
            .remove_package(name)
            .map_err(|e| not_found_as_target(e, JobType::Package, name))?;
        tracing::info!(package = %name, "Package removed");
        Ok(())
    }

    /// Packages whose name matches `pattern`. An empty pattern matches all.
    pub fn list_packages(&self, pattern: &str) -> Result<Vec<Package>> {
        let matcher = name_matcher(pattern)?;
        Ok(self
            .ledger
            .list_packages()?
            .into_iter()
            .filter(|p| matcher.as_ref().map_or(true, |re| re.is_match(&p.name)))
            .collect())
    }

    pub fn add_image(&self, img: &Image) -> Result<Image> {
        img.validate()?;
        let stored = self.ledger.add_image(img)?;
        tracing::info!(image = %stored.name, archs = ?stored.architectures, "Image saved");
        Ok(stored)
    }

    pub async fn remove_image(&self, name: &str) -> Result<()> {
        self.ensure_idle(JobType::Image, name).await?;
        self.ledger
            .remove_image(name)
            .map_err(|e| not_found_as_target(e, JobType::Image, name))?;
        tracing::info!(image = %name, "Image removed");
        Ok(())
    }

    pub fn list_images(&self, pattern: &str) -> Result<Vec<Image>> {
        let matcher = name_matcher(pattern)?;
        Ok(self
            .ledger
            .list_images()?
            .into_iter()
            .filter(|i| matcher.as_ref().map_or(true, |re| re.is_match(&i.name)))
            .collect())
    }

    async fn ensure_idle(&self, job_type: JobType, name: &str) -> Result<()> {
        let registry = self.lifecycle.registry().lock().await;
        let active = registry
            .jobs_for_target(name)
            .into_iter()
            .filter(|job| job.job_type == job_type)
            .count();
        if active > 0 {
            return Err(BuildFarmError::TargetBusy {
                kind: job_type.as_str(),
                name: name.to_string(),
                active,
            });
        }
        Ok(())
    }
}

fn name_matcher(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| BuildFarmError::InvalidArgument(format!("invalid pattern: {}", e)))
}

fn not_found_as_target(err: LedgerError, job_type: JobType, name: &str) -> BuildFarmError {
    match err {
        LedgerError::NotFound { .. } => BuildFarmError::UnknownTarget {
            kind: job_type.as_str(),
            name: name.to_string(),
        },
        other => other.into(),
    }
}
