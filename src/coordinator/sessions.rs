//! Worker sessions.
//!
//! A session lives exactly as long as the worker's subscription stream. It
//! runs one loop per topic the worker serves; each loop holds at most one
//! job at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;
use crate::error::{BuildFarmError, Result};
use crate::ledger::{Image, Package};
use crate::scheduler::{Job, JobStatus, JobType, Topic};

/// A connected worker.
#[derive(Debug)]
pub struct WorkerSession {
    pub id: u64,
    pub name: String,
    pub types: Vec<JobType>,
    pub architectures: Vec<String>,
    subscribed: AtomicBool,
    active: AtomicBool,
    quit: CancellationToken,
}

impl WorkerSession {
    pub fn new(id: u64, name: String, types: Vec<JobType>, architectures: Vec<String>) -> Self {
        Self {
            id,
            name,
            types,
            architectures,
            subscribed: AtomicBool::new(true),
            active: AtomicBool::new(true),
            quit: CancellationToken::new(),
        }
    }

    /// Every topic in the cross product of types and architectures.
    pub fn topics(&self) -> Vec<Topic> {
        self.types
            .iter()
            .flat_map(|t| self.architectures.iter().map(move |a| Topic::new(*t, a)))
            .collect()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Whether the connection is still open.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ask every topic loop to stop once its current job is done.
    pub fn stop(&self) {
        self.subscribed.store(false, Ordering::SeqCst);
        self.quit.cancel();
    }

    fn close(&self) {
        self.stop();
        self.active.store(false, Ordering::SeqCst);
    }

    /// Quit signal handed to each topic loop.
    fn quit_signal(&self) -> CancellationToken {
        self.quit.child_token()
    }
}

/// Workers currently connected, keyed by id.
#[derive(Debug, Default)]
pub struct SessionTable {
    workers: Mutex<HashMap<u64, Arc<WorkerSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Names are unique among subscribed workers.
    pub async fn register(&self, session: Arc<WorkerSession>, max_workers: usize) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers
            .values()
            .any(|w| w.is_subscribed() && w.name == session.name)
        {
            return Err(BuildFarmError::AlreadySubscribed(session.name.clone()));
        }
        if workers.len() >= max_workers {
            return Err(BuildFarmError::TooManyWorkers(max_workers));
        }
        workers.insert(session.id, session);
        Ok(())
    }

    pub async fn get(&self, id: u64) -> Option<Arc<WorkerSession>> {
        self.workers.lock().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: u64) -> Option<Arc<WorkerSession>> {
        self.workers.lock().await.remove(&id)
    }

    pub async fn list(&self) -> Vec<Arc<WorkerSession>> {
        let mut workers: Vec<_> = self.workers.lock().await.values().cloned().collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }
}

/// What a dispatched job builds.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchPayload {
    Package(Package),
    Image(Image),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub job_id: u64,
    pub architecture: String,
    pub payload: DispatchPayload,
}

/// Messages pushed to a worker over its subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Subscribed {
        id: u64,
        images_dir: PathBuf,
        repository_url: String,
    },
    Dispatch(Dispatch),
}

/// Result of handing a claimed job to a worker.
#[derive(Debug)]
pub(crate) enum HandOff {
    /// On its way; fires with the terminal status.
    Sent(oneshot::Receiver<JobStatus>),
    /// Nothing to wait for, keep serving.
    Skipped,
    /// Given back to the router; the worker is leaving.
    Withdrawn,
}

impl Coordinator {
    /// Build what the worker needs to run `job`. Package records are
    /// narrowed to the job's architecture.
    fn dispatch_payload(&self, job: &Job) -> Result<Dispatch> {
        let payload = match job.job_type {
            JobType::Package => {
                let mut pkg = self.ledger.get_package(&job.target)?.ok_or_else(|| {
                    BuildFarmError::UnknownTarget {
                        kind: "package",
                        name: job.target.clone(),
                    }
                })?;
                pkg.architectures = vec![job.architecture.clone()];
                DispatchPayload::Package(pkg)
            }
            JobType::Image => {
                let img = self.ledger.get_image(&job.target)?.ok_or_else(|| {
                    BuildFarmError::UnknownTarget {
                        kind: "image",
                        name: job.target.clone(),
                    }
                })?;
                DispatchPayload::Image(img)
            }
        };
        Ok(Dispatch {
            job_id: job.id,
            architecture: job.architecture.clone(),
            payload,
        })
    }

    /// Fail a job that can never be delivered.
    async fn fail_undeliverable(&self, job: &Job, reason: &BuildFarmError) {
        tracing::warn!(job_id = job.id, error = %reason, "Job cannot be dispatched, failing it");
        for status in [JobStatus::Processing, JobStatus::Failed] {
            if let Err(e) = self.lifecycle.apply_status(job.id, status).await {
                tracing::error!(job_id = job.id, error = %e, "Failed to fail undeliverable job");
                return;
            }
        }
    }

    /// Give back a job this worker claimed but will never run.
    async fn withdraw(&self, worker: &WorkerSession, job_id: u64) {
        if let Some(job) = self.lifecycle.release(job_id, worker.id).await {
            tracing::info!(worker_id = worker.id, job_id, "Re-offering undelivered job");
            self.router.requeue(job).await;
        }
    }

    /// Bind a claimed job to the worker and send it down the stream.
    ///
    /// The quit signal is checked after the job is bound: a disconnect that
    /// started earlier cannot see the job, so the loop gives it back itself.
    pub(crate) async fn hand_off(
        &self,
        worker: &WorkerSession,
        job: Job,
        outbound: &mpsc::Sender<SessionEvent>,
    ) -> HandOff {
        let dispatch = match self.dispatch_payload(&job) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                self.fail_undeliverable(&job, &e).await;
                return HandOff::Skipped;
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        if !self.lifecycle.assign(job.id, worker.id, done_tx).await {
            tracing::warn!(job_id = job.id, "Claimed job is no longer tracked");
            return HandOff::Skipped;
        }

        if worker.quit.is_cancelled() || !worker.is_active() {
            tracing::debug!(worker_id = worker.id, job_id = job.id, "Worker left during hand-off");
            self.withdraw(worker, job.id).await;
            return HandOff::Withdrawn;
        }

        if outbound.send(SessionEvent::Dispatch(dispatch)).await.is_err() {
            tracing::warn!(
                worker_id = worker.id,
                job_id = job.id,
                "Worker stream closed before dispatch, requeueing job"
            );
            self.withdraw(worker, job.id).await;
            return HandOff::Withdrawn;
        }
        HandOff::Sent(done_rx)
    }

    /// Loop serving one topic of one worker.
    ///
    /// Advertise an idle slot, wait for a job or the quit signal, send the
    /// job and wait for its terminal status before advertising again. Quit
    /// never interrupts a job in flight.
    pub(crate) async fn serve_topic(
        self: Arc<Self>,
        worker: Arc<WorkerSession>,
        topic: Topic,
        outbound: mpsc::Sender<SessionEvent>,
    ) {
        let quit = worker.quit_signal();
        tracing::debug!(worker_id = worker.id, topic = %topic, "Topic loop started");

        while !quit.is_cancelled() {
            let mut slot = self.router.advertise(&topic, worker.id).await;
            let job = tokio::select! {
                biased;
                _ = quit.cancelled() => {
                    slot.close();
                    // A job may have landed right before the slot closed
                    if let Ok(job) = slot.try_recv() {
                        self.router.requeue(job).await;
                    }
                    break;
                }
                received = &mut slot => match received {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };
            let job_id = job.id;

            let done_rx = match self.hand_off(&worker, job, &outbound).await {
                HandOff::Sent(done_rx) => done_rx,
                HandOff::Skipped => continue,
                HandOff::Withdrawn => break,
            };
            tracing::info!(
                worker = %worker.name,
                worker_id = worker.id,
                job_id,
                topic = %topic,
                "Job sent to worker"
            );

            match done_rx.await {
                Ok(status) => {
                    tracing::debug!(worker_id = worker.id, job_id, status = %status, "Slot released")
                }
                // Taken back from this worker
                Err(_) => {
                    tracing::debug!(worker_id = worker.id, job_id, "Job withdrawn from slot")
                }
            }
        }
        tracing::debug!(worker_id = worker.id, topic = %topic, "Topic loop exited");
    }

    /// Tear down a worker whose stream ended.
    ///
    /// Jobs it was handed but never started go back to the head of their
    /// topic. Jobs it was building are marked crashed and, if configured,
    /// queued again under a new id.
    pub async fn disconnect(&self, worker_id: u64) {
        let Some(worker) = self.sessions.remove(worker_id).await else {
            return;
        };
        worker.close();

        let owned: Vec<Job> = {
            let registry = self.lifecycle.registry().lock().await;
            registry
                .jobs_for_worker(worker_id)
                .into_iter()
                .cloned()
                .collect()
        };

        for job in owned {
            match job.status {
                JobStatus::Waiting => self.withdraw(&worker, job.id).await,
                JobStatus::Processing => {
                    tracing::warn!(job_id = job.id, worker_id, "Worker lost while processing job");
                    if let Err(e) = self.lifecycle.apply_status(job.id, JobStatus::Crashed).await {
                        tracing::error!(job_id = job.id, error = %e, "Failed to mark orphaned job crashed");
                        continue;
                    }
                    if self.config.requeue_orphaned_jobs {
                        match self
                            .enqueue(job.job_type, &job.target, &job.architecture)
                            .await
                        {
                            Ok(retry) => tracing::info!(
                                job_id = job.id,
                                retry_id = retry.id,
                                "Orphaned job queued again"
                            ),
                            Err(e) => tracing::error!(
                                job_id = job.id,
                                error = %e,
                                "Failed to queue orphaned job again"
                            ),
                        }
                    }
                }
                _ => {}
            }
        }

        tracing::info!(worker = %worker.name, worker_id, "Worker disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::ledger::VcsInfo;
    use crate::scheduler::TracingHooks;
    use tempfile::TempDir;

    fn session(id: u64, name: &str) -> Arc<WorkerSession> {
        Arc::new(WorkerSession::new(
            id,
            name.to_string(),
            vec![JobType::Package, JobType::Image],
            vec!["x86_64".to_string(), "aarch64".to_string()],
        ))
    }

    #[test]
    fn topics_are_the_cross_product() {
        let topics: Vec<String> = session(1, "w")
            .topics()
            .iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(
            topics,
            vec![
                "package/x86_64",
                "package/aarch64",
                "image/x86_64",
                "image/aarch64"
            ]
        );
    }

    #[tokio::test]
    async fn names_are_unique_among_subscribed_workers() {
        let table = SessionTable::new();
        let first = session(1, "builder");
        table.register(first.clone(), 10).await.unwrap();

        let err = table.register(session(2, "builder"), 10).await.unwrap_err();
        assert!(matches!(err, BuildFarmError::AlreadySubscribed(_)));

        // Once unsubscribed the name is free again
        first.stop();
        table.register(session(3, "builder"), 10).await.unwrap();
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn worker_limit_is_enforced() {
        let table = SessionTable::new();
        table.register(session(1, "a"), 1).await.unwrap();
        let err = table.register(session(2, "b"), 1).await.unwrap_err();
        assert!(matches!(err, BuildFarmError::TooManyWorkers(1)));
    }

    #[test]
    fn stop_cancels_topic_signals() {
        let worker = session(1, "w");
        let signal = worker.quit_signal();
        assert!(!signal.is_cancelled());
        worker.stop();
        assert!(signal.is_cancelled());
        assert!(!worker.is_subscribed());
        assert!(worker.is_active());
    }

    /// Coordinator with one package job already claimed from the queue.
    async fn claimed_job(dir: &TempDir) -> (Arc<Coordinator>, Job) {
        let config = CoordinatorConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            dir.path().join("ledger.redb"),
        );
        let coordinator = Coordinator::open(config, Arc::new(TracingHooks)).unwrap();
        coordinator
            .add_package(&Package {
                name: "foo".to_string(),
                architectures: vec!["x86_64".to_string()],
                vcs: VcsInfo::new("https://git.example.org/rpms/foo.git", "master"),
                ..Default::default()
            })
            .unwrap();
        let job = coordinator
            .enqueue(JobType::Package, "foo", "x86_64")
            .await
            .unwrap();
        let job = coordinator.lifecycle().mark_waiting(job.id).await.unwrap();
        (coordinator, job)
    }

    async fn backlog(coordinator: &Coordinator) -> usize {
        coordinator
            .router()
            .backlog_len(&Topic::new(JobType::Package, "x86_64"))
            .await
    }

    #[tokio::test]
    async fn job_claimed_while_worker_disconnects_goes_back_in_line() {
        let dir = TempDir::new().unwrap();
        let (coordinator, job) = claimed_job(&dir).await;
        let worker = session(1, "w");
        coordinator.sessions().register(worker.clone(), 10).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        // The disconnect finishes before the loop binds the job it claimed
        coordinator.disconnect(worker.id).await;
        let outcome = coordinator.hand_off(&worker, job.clone(), &tx).await;

        assert!(matches!(outcome, HandOff::Withdrawn));
        assert!(rx.try_recv().is_err());
        assert_eq!(backlog(&coordinator).await, 1);
        let registry = coordinator.lifecycle().registry().lock().await;
        let stored = registry.get(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert_eq!(stored.assigned_worker, None);
    }

    #[tokio::test]
    async fn job_is_requeued_when_the_stream_is_gone() {
        let dir = TempDir::new().unwrap();
        let (coordinator, job) = claimed_job(&dir).await;
        let worker = session(1, "w");
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        let outcome = coordinator.hand_off(&worker, job, &tx).await;
        assert!(matches!(outcome, HandOff::Withdrawn));
        assert_eq!(backlog(&coordinator).await, 1);
    }

    #[tokio::test]
    async fn disconnect_after_hand_off_requeues_exactly_once() {
        let dir = TempDir::new().unwrap();
        let (coordinator, job) = claimed_job(&dir).await;
        let worker = session(1, "w");
        coordinator.sessions().register(worker.clone(), 10).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        let done_rx = match coordinator.hand_off(&worker, job.clone(), &tx).await {
            HandOff::Sent(done_rx) => done_rx,
            other => panic!("unexpected hand-off {:?}", other),
        };
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Dispatch(_))));

        coordinator.disconnect(worker.id).await;
        // Both sides try to give the job back; only one succeeds
        coordinator.withdraw(&worker, job.id).await;

        assert!(done_rx.await.is_err());
        assert_eq!(backlog(&coordinator).await, 1);
    }
}
