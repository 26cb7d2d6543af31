use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::WorkerConfig;
use crate::coordinator::Dispatch;
use crate::error::{BuildFarmError, Result};
use crate::grpc::convert::{status_to_proto, step_to_proto};
use crate::proto::builder_client::BuilderClient;
use crate::proto::{
    coordinator_message, worker_message, JobUpdateRequest, SubscribeRequest, UnsubscribeRequest,
    WorkerMessage,
};
use crate::scheduler::{JobStatus, Step};
use crate::worker::executor::PipelineExecutor;
use crate::worker::transfer::upload_all;

/// What the coordinator told us when we subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: u64,
    pub images_dir: String,
    pub repository_url: String,
}

/// Worker process: subscribes to the coordinator, runs dispatched jobs and
/// reports back over the same stream.
pub struct WorkerClient {
    config: WorkerConfig,
    executor: PipelineExecutor,
}

/// Everything a job task needs.
struct JobContext {
    registration: Registration,
    release: String,
    client: BuilderClient<Channel>,
    updates: mpsc::Sender<WorkerMessage>,
    executor: PipelineExecutor,
    work_root: PathBuf,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig) -> Self {
        let executor = PipelineExecutor::new(config.pipeline.clone());
        Self { config, executor }
    }

    pub async fn connect(&self) -> Result<BuilderClient<Channel>> {
        let endpoint = Endpoint::from_shared(self.config.coordinator_url.clone())
            .map_err(|e| BuildFarmError::InvalidArgument(format!("Invalid endpoint: {}", e)))?;
        let channel = endpoint.connect().await?;
        Ok(BuilderClient::new(channel))
    }

    /// Serve jobs until `shutdown` is cancelled or the coordinator goes away.
    ///
    /// On shutdown the worker unsubscribes and lets jobs in flight finish
    /// before closing its stream.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let client = self.connect().await?;
        let (updates, outbound) = mpsc::channel(32);
        updates
            .send(WorkerMessage {
                payload: Some(worker_message::Payload::Subscription(SubscribeRequest {
                    name: self.config.name.clone(),
                    types: self.config.types.clone(),
                    architectures: self.config.architectures.clone(),
                })),
            })
            .await
            .map_err(|_| BuildFarmError::Internal("update channel closed".to_string()))?;

        let mut inbound = client
            .clone()
            .subscribe(ReceiverStream::new(outbound))
            .await?
            .into_inner();

        let registration = match inbound.message().await? {
            Some(message) => match message.payload {
                Some(coordinator_message::Payload::Subscription(sub)) => Registration {
                    id: sub.id,
                    images_dir: sub.images_dir,
                    repository_url: sub.repository_url,
                },
                _ => {
                    return Err(BuildFarmError::Internal(
                        "coordinator did not confirm the subscription".to_string(),
                    ))
                }
            },
            None => {
                return Err(BuildFarmError::Internal(
                    "coordinator closed the stream".to_string(),
                ))
            }
        };
        tracing::info!(
            worker = %self.config.name,
            worker_id = registration.id,
            images_dir = %registration.images_dir,
            repository_url = %registration.repository_url,
            "Subscribed to coordinator"
        );

        let ctx = Arc::new(JobContext {
            registration: registration.clone(),
            release: self.config.release.clone(),
            client: client.clone(),
            updates: updates.clone(),
            executor: self.executor.clone(),
            work_root: self.config.pipeline.work_dir.clone(),
        });
        let mut jobs = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(worker_id = registration.id, "Shutting down worker");
                    if let Err(e) = client
                        .clone()
                        .unsubscribe(UnsubscribeRequest { id: registration.id })
                        .await
                    {
                        tracing::warn!(error = %e, "Unsubscribe failed");
                    }
                    break;
                }
                message = inbound.message() => match message {
                    Ok(Some(message)) => match message.payload {
                        Some(coordinator_message::Payload::JobDispatch(request)) => {
                            match Dispatch::try_from(request) {
                                Ok(dispatch) => {
                                    jobs.spawn(ctx.clone().run_job(dispatch));
                                }
                                Err(e) => tracing::warn!(error = %e.message(), "Malformed dispatch ignored"),
                            }
                        }
                        _ => tracing::warn!("Unexpected coordinator message ignored"),
                    },
                    Ok(None) => {
                        tracing::warn!("Coordinator closed the stream");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Coordinator stream failed");
                        break;
                    }
                },
                Some(_) = jobs.join_next(), if !jobs.is_empty() => {}
            }
        }

        while jobs.join_next().await.is_some() {}
        Ok(())
    }
}

impl JobContext {
    async fn send_status(&self, job_id: u64, status: JobStatus) {
        let update = WorkerMessage {
            payload: Some(worker_message::Payload::JobUpdate(JobUpdateRequest {
                worker_id: self.registration.id,
                id: job_id,
                status: status_to_proto(status) as i32,
            })),
        };
        if self.updates.send(update).await.is_err() {
            tracing::warn!(job_id, status = %status, "Stream closed, status not reported");
        }
    }

    async fn send_step(&self, job_id: u64, step: Step) {
        let update = WorkerMessage {
            payload: Some(worker_message::Payload::StepUpdate(step_to_proto(job_id, step))),
        };
        if self.updates.send(update).await.is_err() {
            tracing::warn!(job_id, "Stream closed, step not reported");
        }
    }

    /// Run one dispatched job from `Processing` to its terminal status.
    async fn run_job(self: Arc<Self>, dispatch: Dispatch) {
        let job_id = dispatch.job_id;
        self.send_status(job_id, JobStatus::Processing).await;

        let work_dir = self.work_root.join(job_id.to_string());
        let output_dir = work_dir.join("output");
        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            tracing::error!(job_id, error = %e, "Failed to prepare work directory");
            self.send_status(job_id, JobStatus::Crashed).await;
            return;
        }

        let outcome = self.executor.execute(&dispatch, &work_dir, &output_dir).await;
        self.send_step(job_id, outcome.step).await;

        let mut status = outcome.status;
        if status == JobStatus::Successful {
            if let Err(e) = self.upload_outputs(&dispatch, &output_dir).await {
                tracing::error!(job_id, error = %e, "Artifact upload failed");
                status = JobStatus::Failed;
            }
        }
        self.send_status(job_id, status).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            tracing::debug!(job_id, error = %e, "Failed to clean work directory");
        }
    }

    async fn upload_outputs(
        &self,
        dispatch: &Dispatch,
        output_dir: &Path,
    ) -> std::result::Result<(), crate::transfer::TransferError> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        if files.is_empty() {
            return Ok(());
        }
        upload_all(&self.client, &files, &self.release, &dispatch.architecture).await?;
        Ok(())
    }
}
