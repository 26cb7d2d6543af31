//! Worker side of artifact transfer.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Channel;
use tonic::Status;

use crate::proto::builder_client::BuilderClient;
use crate::proto::{
    download_message, upload_message, DownloadMessage, DownloadRequest, UploadChunk, UploadEnd, UploadMessage,
    UploadRequest,
};
use crate::transfer::{self, ChunkReader, IntegrityWriter, Trailer, TransferError, TransferResult};

fn upload_message(payload: upload_message::Payload) -> UploadMessage {
    UploadMessage {
        payload: Some(payload),
    }
}

/// Stream one file to the coordinator and check the byte count it reports.
pub async fn upload_file(
    mut client: BuilderClient<Channel>,
    path: &Path,
    release: &str,
    arch: &str,
) -> TransferResult<u64> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?;
    let metadata = tokio::fs::metadata(path).await?;
    let permission = metadata.permissions().mode() & 0o777;
    let mut reader = ChunkReader::open(path).await?;

    let (tx, rx) = mpsc::channel(4);
    tx.send(upload_message(upload_message::Payload::Request(UploadRequest {
        file_name: file_name.clone(),
        release: release.to_string(),
        architecture: arch.to_string(),
    })))
    .await
    .map_err(|_| TransferError::Protocol("upload stream closed".to_string()))?;

    // Feed chunks while the RPC consumes them
    let feeder = tokio::spawn(async move {
        while let Some(data) = reader.next_chunk().await? {
            let chunk = upload_message(upload_message::Payload::Chunk(UploadChunk { data }));
            if tx.send(chunk).await.is_err() {
                // The coordinator gave up; its status says why
                return Ok(None);
            }
        }
        let trailer = reader.finish();
        let end = upload_message(upload_message::Payload::End(UploadEnd {
            hash: trailer.hash.clone(),
            permission,
            size: trailer.size as i64,
        }));
        let _ = tx.send(end).await;
        Ok::<_, TransferError>(Some(trailer))
    });

    let response = client.upload(ReceiverStream::new(rx)).await;
    let fed = feeder
        .await
        .map_err(|e| TransferError::Protocol(format!("upload task failed: {}", e)))?;
    let trailer = fed?;
    let total_size = response?.into_inner().total_size;

    let local = trailer.map(|t| t.size).unwrap_or(metadata.len());
    if total_size < 0 || total_size as u64 != local {
        return Err(TransferError::SizeMismatch {
            file: file_name,
            expected: local,
            actual: total_size.max(0) as u64,
        });
    }
    tracing::info!(file = %file_name, bytes = local, "Artifact uploaded");
    Ok(local)
}

/// Upload every file concurrently. All uploads run to completion; the first
/// failure is reported.
pub async fn upload_all(
    client: &BuilderClient<Channel>,
    paths: &[PathBuf],
    release: &str,
    arch: &str,
) -> TransferResult<Vec<u64>> {
    let uploads = paths
        .iter()
        .map(|path| upload_file(client.clone(), path, release, arch));
    let results = futures::future::join_all(uploads).await;
    for (path, result) in paths.iter().zip(&results) {
        if let Err(e) = result {
            tracing::error!(path = %path.display(), error = %e, "Upload failed");
        }
    }
    transfer::aggregate(results)
}

/// Fetch `file_name` from the coordinator's repository into `destination`.
pub async fn download_file(
    mut client: BuilderClient<Channel>,
    file_name: &str,
    destination: PathBuf,
) -> TransferResult<u64> {
    let inbound = client
        .download(DownloadRequest {
            file_name: file_name.to_string(),
        })
        .await?
        .into_inner();
    receive_download(inbound, file_name, destination).await
}

/// Write a download stream to `destination`, checking it against the
/// trailer. Nothing is left behind when the check fails.
pub async fn receive_download<S>(
    mut inbound: S,
    file_name: &str,
    destination: PathBuf,
) -> TransferResult<u64>
where
    S: Stream<Item = Result<DownloadMessage, Status>> + Unpin,
{
    let mut writer = IntegrityWriter::create(destination).await?;
    let trailer = loop {
        let message = match inbound.next().await {
            Some(Ok(message)) => message,
            None => break None,
            Some(Err(status)) => {
                writer.abort().await;
                return Err(status.into());
            }
        };
        match message.payload {
            Some(download_message::Payload::Chunk(chunk)) => {
                if let Err(e) = writer.write(&chunk.data).await {
                    writer.abort().await;
                    return Err(e);
                }
            }
            Some(download_message::Payload::End(end)) => {
                break Some(Trailer {
                    hash: end.hash,
                    size: end.size.max(0) as u64,
                })
            }
            None => {}
        }
    };

    let Some(trailer) = trailer else {
        writer.abort().await;
        return Err(TransferError::Protocol(format!(
            "download of {} ended without trailer",
            file_name
        )));
    };
    let written = writer.commit(&trailer, None).await?;
    tracing::info!(file = %file_name, bytes = written, "File downloaded");
    Ok(written)
}
