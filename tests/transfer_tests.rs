//! Artifact upload and repository download over a real gRPC connection.


use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use buildfarm::proto::{
    download_message, upload_message, DownloadChunk, DownloadEnd, DownloadMessage, UploadChunk,
    UploadEnd, UploadMessage, UploadRequest,
};
use buildfarm::transfer::{sha256_hex, TransferError, CHUNK_SIZE};
use buildfarm::worker::transfer::{download_file, receive_download, upload_all, upload_file};
use tempfile::TempDir;
use test_harness::TestFarm;
use tokio_stream::iter;
use tonic::{Code, Status};

fn staging_rpm(farm: &TestFarm, release: &str, arch: &str, name: &str) -> PathBuf {
    let letter = name[..1].to_ascii_lowercase();
    farm.coordinator
        .config()
        .storage
        .staging_repo_dir
        .join("fedora/releases")
        .join(release)
        .join("Everything")
        .join(arch)
        .join("os/Packages")
        .join(letter)
        .join(name)
}

fn message(payload: upload_message::Payload) -> UploadMessage {
    UploadMessage {
        payload: Some(payload),
    }
}

#[tokio::test]
async fn test_upload_lands_in_staging_repository() {
    let farm = TestFarm::start_with_server().await;
    let local = TempDir::new().unwrap();
    let path = local.path().join("foo-1.0-1.x86_64.rpm");
    std::fs::write(&path, b"not really an rpm").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

    let written = upload_file(farm.client().await, &path, "40", "x86_64")
        .await
        .unwrap();
    assert_eq!(written, 17);

    let stored = staging_rpm(&farm, "40", "x86_64", "foo-1.0-1.x86_64.rpm");
    assert_eq!(std::fs::read(&stored).unwrap(), b"not really an rpm");
    // Mode travels with the trailer
    let mode = std::fs::metadata(&stored).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_upload_spanning_several_chunks() {
    let farm = TestFarm::start_with_server().await;
    let local = TempDir::new().unwrap();
    let path = local.path().join("workstation.iso");
    let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + CHUNK_SIZE / 2))
        .map(|i| (i % 251) as u8)
        .collect();
    std::fs::write(&path, &data).unwrap();

    let written = upload_file(farm.client().await, &path, "rawhide", "aarch64")
        .await
        .unwrap();
    assert_eq!(written, data.len() as u64);

    let stored = farm
        .coordinator
        .config()
        .storage
        .images_dir
        .join("rawhide/aarch64/workstation.iso");
    assert_eq!(std::fs::read(&stored).unwrap(), data);
}

#[tokio::test]
async fn test_corrupted_upload_is_rejected_and_discarded() {
    let farm = TestFarm::start_with_server().await;
    let mut client = farm.client().await;

    let mut payload = b"some package payload".to_vec();
    let declared = sha256_hex(&payload);
    payload[3] ^= 0x01;

    let messages = vec![
        message(upload_message::Payload::Request(UploadRequest {
            file_name: "bar-1.0-1.x86_64.rpm".to_string(),
            release: "40".to_string(),
            architecture: "x86_64".to_string(),
        })),
        message(upload_message::Payload::Chunk(UploadChunk {
            data: payload.clone(),
        })),
        message(upload_message::Payload::End(UploadEnd {
            hash: declared,
            permission: 0,
            size: payload.len() as i64,
        })),
    ];
    let status = client.upload(iter(messages)).await.unwrap_err();
    assert_eq!(status.code(), Code::DataLoss);

    let stored = staging_rpm(&farm, "40", "x86_64", "bar-1.0-1.x86_64.rpm");
    assert!(!stored.exists());
    // No partial file left next to it either
    let leftovers: Vec<_> = std::fs::read_dir(stored.parent().unwrap())
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
}

#[tokio::test]
async fn test_upload_without_trailer_is_rejected() {
    let farm = TestFarm::start_with_server().await;
    let mut client = farm.client().await;

    let messages = vec![
        message(upload_message::Payload::Request(UploadRequest {
            file_name: "baz-1.0-1.x86_64.rpm".to_string(),
            release: "40".to_string(),
            architecture: "x86_64".to_string(),
        })),
        message(upload_message::Payload::Chunk(UploadChunk {
            data: b"partial".to_vec(),
        })),
    ];
    let status = client.upload(iter(messages)).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(!staging_rpm(&farm, "40", "x86_64", "baz-1.0-1.x86_64.rpm").exists());
}

#[tokio::test]
async fn test_upload_of_unknown_artifact_kind_is_rejected() {
    let farm = TestFarm::start_with_server().await;
    let local = TempDir::new().unwrap();
    let path = local.path().join("build.log");
    std::fs::write(&path, b"log").unwrap();

    let err = upload_file(farm.client().await, &path, "40", "x86_64")
        .await
        .unwrap_err();
    match err {
        TransferError::Remote(status) => assert_eq!(status.code(), Code::InvalidArgument),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_upload_all_reports_first_failure_after_all_finish() {
    let farm = TestFarm::start_with_server().await;
    let local = TempDir::new().unwrap();
    let good = local.path().join("foo-1.0-1.x86_64.rpm");
    let bad = local.path().join("README");
    std::fs::write(&good, b"rpm").unwrap();
    std::fs::write(&bad, b"text").unwrap();

    let err = upload_all(
        &farm.client().await,
        &[good.clone(), bad.clone()],
        "40",
        "x86_64",
    )
    .await
    .unwrap_err();
    match err {
        TransferError::Aggregate { failed, total, .. } => assert_eq!((failed, total), (1, 2)),
        other => panic!("unexpected error {:?}", other),
    }
    // The good file still made it
    assert!(staging_rpm(&farm, "40", "x86_64", "foo-1.0-1.x86_64.rpm").exists());
}

#[tokio::test]
async fn test_download_from_main_repository() {
    let farm = TestFarm::start_with_server().await;
    let repo = &farm.coordinator.config().storage.main_repo_dir;
    std::fs::create_dir_all(repo.join("repodata")).unwrap();
    let content = vec![7u8; CHUNK_SIZE + 10];
    std::fs::write(repo.join("repodata/repomd.xml"), &content).unwrap();

    let local = TempDir::new().unwrap();
    let destination = local.path().join("nested/repomd.xml");
    let written = download_file(farm.client().await, "repodata/repomd.xml", destination.clone())
        .await
        .unwrap();
    assert_eq!(written, content.len() as u64);
    assert_eq!(std::fs::read(&destination).unwrap(), content);
}

#[tokio::test]
async fn test_download_errors() {
    let farm = TestFarm::start_with_server().await;
    let local = TempDir::new().unwrap();

    let err = download_file(farm.client().await, "missing.rpm", local.path().join("a"))
        .await
        .unwrap_err();
    match err {
        TransferError::Remote(status) => assert_eq!(status.code(), Code::NotFound),
        other => panic!("unexpected error {:?}", other),
    }

    let err = download_file(farm.client().await, "../ledger.redb", local.path().join("b"))
        .await
        .unwrap_err();
    match err {
        TransferError::Remote(status) => assert_eq!(status.code(), Code::InvalidArgument),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!local.path().join("a").exists());
    assert!(!local.path().join("b").exists());
}

#[tokio::test]
async fn test_upload_with_wrong_declared_size_is_rejected() {
    let farm = TestFarm::start_with_server().await;
    let mut client = farm.client().await;

    let payload = b"matching hash, wrong size".to_vec();
    let messages = vec![
        message(upload_message::Payload::Request(UploadRequest {
            file_name: "qux-1.0-1.x86_64.rpm".to_string(),
            release: "40".to_string(),
            architecture: "x86_64".to_string(),
        })),
        message(upload_message::Payload::Chunk(UploadChunk {
            data: payload.clone(),
        })),
        message(upload_message::Payload::End(UploadEnd {
            hash: sha256_hex(&payload),
            permission: 0,
            size: payload.len() as i64 + 1,
        })),
    ];
    let status = client.upload(iter(messages)).await.unwrap_err();
    assert_eq!(status.code(), Code::DataLoss);

    let stored = staging_rpm(&farm, "40", "x86_64", "qux-1.0-1.x86_64.rpm");
    assert!(!stored.exists());
    let leftovers: Vec<_> = std::fs::read_dir(stored.parent().unwrap())
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
}

fn download(payload: download_message::Payload) -> Result<DownloadMessage, Status> {
    Ok(DownloadMessage {
        payload: Some(payload),
    })
}

#[tokio::test]
async fn test_download_with_bad_hash_leaves_nothing_behind() {
    let local = TempDir::new().unwrap();
    let destination = local.path().join("repodata/repomd.xml");

    let data = b"<repomd/>".to_vec();
    let actual = sha256_hex(&data);
    let flipped = if actual.starts_with('0') { "1" } else { "0" };
    let declared = format!("{}{}", flipped, &actual[1..]);
    let messages = vec![
        download(download_message::Payload::Chunk(DownloadChunk { data: data.clone() })),
        download(download_message::Payload::End(DownloadEnd {
            hash: declared,
            size: data.len() as i64,
        })),
    ];

    let err = receive_download(iter(messages), "repodata/repomd.xml", destination.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::HashMismatch { .. }), "{:?}", err);
    assert!(!destination.exists());
    let leftovers: Vec<_> = std::fs::read_dir(destination.parent().unwrap())
        .unwrap()
        .flatten()
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
}

#[tokio::test]
async fn test_download_stream_error_discards_partial_file() {
    let local = TempDir::new().unwrap();
    let destination = local.path().join("big.iso");
    let messages = vec![
        download(download_message::Payload::Chunk(DownloadChunk {
            data: vec![1u8; 64],
        })),
        Err(Status::unavailable("connection reset")),
    ];

    let err = receive_download(iter(messages), "big.iso", destination.clone())
        .await
        .unwrap_err();
    match err {
        TransferError::Remote(status) => assert_eq!(status.code(), Code::Unavailable),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 0);
}
