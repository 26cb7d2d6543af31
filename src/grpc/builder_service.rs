use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::coordinator::Coordinator;
use crate::grpc::convert::{status_from_proto, target_type_from_proto};
use crate::ledger::{Image, Package};
use crate::proto::builder_server::Builder;
use crate::proto::{
    download_message, upload_message, worker_message, BooleanMessage, CollectJobRequest,
    CollectJobResponse, CoordinatorMessage, DownloadChunk, DownloadEnd, DownloadMessage,
    DownloadRequest, ImageInfo, PackageInfo, StringMessage, UnsubscribeRequest,
    UnsubscribeResponse, UploadMessage, UploadResponse, WorkerMessage,
};
use crate::transfer::{self, ChunkReader, IntegrityWriter, Trailer, TransferError};

type ResponseStream<T> = Pin<Box<dyn tokio_stream::Stream<Item = Result<T, Status>> + Send>>;

/// gRPC front of the coordinator, used by workers and clients alike.
pub struct BuilderService {
    coordinator: Arc<Coordinator>,
}

impl BuilderService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Apply job and step updates arriving on a worker stream until it
    /// closes, then tear the worker down.
    async fn pump_updates(
        coordinator: Arc<Coordinator>,
        worker_id: u64,
        mut inbound: Streaming<WorkerMessage>,
    ) {
        loop {
            let message = match inbound.message().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Worker stream failed");
                    break;
                }
            };

            match message.payload {
                Some(worker_message::Payload::JobUpdate(update)) => {
                    if update.worker_id != 0 && update.worker_id != worker_id {
                        tracing::warn!(
                            worker_id,
                            claimed = update.worker_id,
                            job_id = update.id,
                            "Job update from a different worker id, discarded"
                        );
                        continue;
                    }
                    let status = match status_from_proto(update.status) {
                        Ok(status) => status,
                        Err(e) => {
                            tracing::warn!(worker_id, job_id = update.id, error = %e.message(), "Job update discarded");
                            continue;
                        }
                    };
                    if let Err(e) = coordinator
                        .report_status(worker_id, update.id, status)
                        .await
                    {
                        tracing::warn!(worker_id, job_id = update.id, status = %status, error = %e, "Job update discarded");
                    }
                }
                Some(worker_message::Payload::StepUpdate(update)) => {
                    let job_id = update.job_id;
                    if let Err(e) = coordinator
                        .report_step(worker_id, job_id, update.into())
                        .await
                    {
                        tracing::warn!(worker_id, job_id, error = %e, "Step update discarded");
                    }
                }
                Some(worker_message::Payload::Subscription(_)) => {
                    tracing::warn!(worker_id, "Repeated subscription ignored");
                }
                None => {
                    tracing::warn!(worker_id, "Empty worker message ignored");
                }
            }
        }
        coordinator.disconnect(worker_id).await;
    }

    async fn receive_upload(
        &self,
        mut inbound: Streaming<UploadMessage>,
    ) -> Result<u64, TransferError> {
        let header = match inbound.message().await? {
            Some(UploadMessage {
                payload: Some(upload_message::Payload::Request(header)),
            }) => header,
            _ => {
                return Err(TransferError::Protocol(
                    "upload must start with a request".to_string(),
                ))
            }
        };

        let destination = transfer::upload_destination(
            &self.coordinator.config().storage,
            &header.file_name,
            &header.release,
            &header.architecture,
        )?;
        let mut writer = IntegrityWriter::create(destination).await?;

        let outcome = read_upload_body(&mut inbound, &mut writer).await;

        match outcome {
            Ok((trailer, permission)) => {
                let destination = writer.destination().display().to_string();
                let written = writer.commit(&trailer, Some(permission)).await?;
                tracing::info!(file = %header.file_name, path = %destination, bytes = written, "Upload stored");
                Ok(written)
            }
            Err(e) => {
                writer.abort().await;
                Err(e)
            }
        }
    }
}

/// Feed chunks to `writer` until the trailer arrives.
async fn read_upload_body(
    inbound: &mut Streaming<UploadMessage>,
    writer: &mut IntegrityWriter,
) -> Result<(Trailer, u32), TransferError> {
    loop {
        match inbound.message().await? {
            Some(UploadMessage {
                payload: Some(upload_message::Payload::Chunk(chunk)),
            }) => writer.write(&chunk.data).await?,
            Some(UploadMessage {
                payload: Some(upload_message::Payload::End(end)),
            }) => {
                let size = u64::try_from(end.size)
                    .map_err(|_| TransferError::Protocol(format!("negative size {}", end.size)))?;
                return Ok((
                    Trailer {
                        hash: end.hash,
                        size,
                    },
                    end.permission,
                ));
            }
            Some(_) => {
                return Err(TransferError::Protocol(
                    "unexpected message during upload".to_string(),
                ))
            }
            None => {
                return Err(TransferError::Protocol(
                    "upload ended without trailer".to_string(),
                ))
            }
        }
    }
}

#[tonic::async_trait]
impl Builder for BuilderService {
    type SubscribeStream = ResponseStream<CoordinatorMessage>;
    type ListPackagesStream = ResponseStream<PackageInfo>;
    type ListImagesStream = ResponseStream<ImageInfo>;
    type DownloadStream = ResponseStream<DownloadMessage>;

    async fn subscribe(
        &self,
        request: Request<Streaming<WorkerMessage>>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let mut inbound = request.into_inner();

        let subscription = match inbound.message().await? {
            Some(WorkerMessage {
                payload: Some(worker_message::Payload::Subscription(sub)),
            }) => sub,
            _ => {
                return Err(Status::invalid_argument(
                    "First message must be a subscription",
                ))
            }
        };

        let (worker, events) = self
            .coordinator
            .subscribe(
                &subscription.name,
                &subscription.types,
                &subscription.architectures,
            )
            .await?;

        tokio::spawn(Self::pump_updates(
            self.coordinator.clone(),
            worker.id,
            inbound,
        ));

        let stream = ReceiverStream::new(events).map(|event| Ok(CoordinatorMessage::from(event)));
        Ok(Response::new(Box::pin(stream) as Self::SubscribeStream))
    }

    async fn unsubscribe(
        &self,
        request: Request<UnsubscribeRequest>,
    ) -> Result<Response<UnsubscribeResponse>, Status> {
        let req = request.into_inner();
        self.coordinator.unsubscribe(req.id).await?;
        Ok(Response::new(UnsubscribeResponse { result: true }))
    }

    async fn collect_job(
        &self,
        request: Request<CollectJobRequest>,
    ) -> Result<Response<CollectJobResponse>, Status> {
        let req = request.into_inner();
        let job_type = target_type_from_proto(req.target_type)?;
        let job = self
            .coordinator
            .enqueue(job_type, &req.target, &req.architecture)
            .await?;
        Ok(Response::new(CollectJobResponse {
            result: true,
            id: job.id,
        }))
    }

    async fn add_package(
        &self,
        request: Request<PackageInfo>,
    ) -> Result<Response<BooleanMessage>, Status> {
        let pkg = Package::from(request.into_inner());
        self.coordinator.add_package(&pkg)?;
        Ok(Response::new(BooleanMessage { result: true }))
    }

    async fn remove_package(
        &self,
        request: Request<StringMessage>,
    ) -> Result<Response<BooleanMessage>, Status> {
        let name = request.into_inner().name;
        self.coordinator.remove_package(&name).await?;
        Ok(Response::new(BooleanMessage { result: true }))
    }

    async fn list_packages(
        &self,
        request: Request<StringMessage>,
    ) -> Result<Response<Self::ListPackagesStream>, Status> {
        let pattern = request.into_inner().name;
        let packages = self.coordinator.list_packages(&pattern)?;

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            for pkg in packages {
                if tx.send(Ok(PackageInfo::from(pkg))).await.is_err() {
                    // Client disconnected
                    break;
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::ListPackagesStream))
    }

    async fn add_image(
        &self,
        request: Request<ImageInfo>,
    ) -> Result<Response<BooleanMessage>, Status> {
        let img = Image::from(request.into_inner());
        self.coordinator.add_image(&img)?;
        Ok(Response::new(BooleanMessage { result: true }))
    }

    async fn remove_image(
        &self,
        request: Request<StringMessage>,
    ) -> Result<Response<BooleanMessage>, Status> {
        let name = request.into_inner().name;
        self.coordinator.remove_image(&name).await?;
        Ok(Response::new(BooleanMessage { result: true }))
    }

    async fn list_images(
        &self,
        request: Request<StringMessage>,
    ) -> Result<Response<Self::ListImagesStream>, Status> {
        let pattern = request.into_inner().name;
        let images = self.coordinator.list_images(&pattern)?;

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            for img in images {
                if tx.send(Ok(ImageInfo::from(img))).await.is_err() {
                    break;
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::ListImagesStream))
    }

    async fn upload(
        &self,
        request: Request<Streaming<UploadMessage>>,
    ) -> Result<Response<UploadResponse>, Status> {
        match self.receive_upload(request.into_inner()).await {
            Ok(written) => Ok(Response::new(UploadResponse {
                total_size: written as i64,
            })),
            Err(e) => {
                tracing::error!(error = %e, "Upload failed");
                Err(e.into())
            }
        }
    }

    async fn download(
        &self,
        request: Request<DownloadRequest>,
    ) -> Result<Response<Self::DownloadStream>, Status> {
        let file_name = request.into_inner().file_name;
        let path =
            transfer::resolve_download(&self.coordinator.config().storage.main_repo_dir, &file_name)?;
        let mut reader = ChunkReader::open(&path).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            loop {
                let message = match reader.next_chunk().await {
                    Ok(Some(data)) => download_message::Payload::Chunk(DownloadChunk { data }),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(file = %file_name, error = %e, "Download failed");
                        let _ = tx.send(Err(Status::from(e))).await;
                        return;
                    }
                };
                let message = DownloadMessage {
                    payload: Some(message),
                };
                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
            }

            let trailer = reader.finish();
            tracing::debug!(file = %file_name, bytes = trailer.size, "Download sent");
            let end = DownloadMessage {
                payload: Some(download_message::Payload::End(DownloadEnd {
                    hash: trailer.hash,
                    size: trailer.size as i64,
                })),
            };
            let _ = tx.send(Ok(end)).await;
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::DownloadStream))
    }
}
