//! Chunked artifact transfer with end-to-end SHA-256 verification.
//!
//! Both directions use the same framing: a header naming the file, data
//! chunks of at most [`CHUNK_SIZE`] bytes, then a trailer with the hex digest
//! of everything sent and the byte count. Receivers hash as they write and
//! only move the file into place once the trailer matches.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::StorageConfig;

pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Mode applied to uploads whose trailer does not carry one.
pub const DEFAULT_PERMISSION: u32 = 0o644;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid file name \"{0}\"")]
    InvalidName(String),

    #[error("Hash mismatch for {file}: expected {expected}, computed {actual}")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Size mismatch for {file}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer rejected transfer: {0}")]
    Remote(#[from] tonic::Status),

    #[error("{failed} of {total} transfers failed, first error: {first}")]
    Aggregate {
        failed: usize,
        total: usize,
        first: Box<TransferError>,
    },
}

impl TransferError {
    /// Whether the bytes that arrived differ from what the sender declared.
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            TransferError::HashMismatch { .. } | TransferError::SizeMismatch { .. } => true,
            TransferError::Aggregate { first, .. } => first.is_integrity_failure(),
            _ => false,
        }
    }
}

impl From<TransferError> for tonic::Status {
    fn from(err: TransferError) -> Self {
        let message = err.to_string();
        match err {
            TransferError::InvalidName(_) | TransferError::Protocol(_) => {
                tonic::Status::invalid_argument(message)
            }
            TransferError::HashMismatch { .. } | TransferError::SizeMismatch { .. } => {
                tonic::Status::data_loss(message)
            }
            TransferError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tonic::Status::not_found(message)
            }
            TransferError::Io(_) => tonic::Status::internal(message),
            TransferError::Remote(status) => status,
            TransferError::Aggregate { first, .. } => {
                let code = tonic::Status::from(*first).code();
                tonic::Status::new(code, message)
            }
        }
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// Digest and length of a transferred file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub hash: String,
    pub size: u64,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ----- destinations -----------------------------------------------------------

struct Rules {
    source_rpm: Regex,
    debug_rpm: Regex,
    rpm: Regex,
    image: Regex,
}

fn rules() -> &'static Rules {
    static RULES: OnceLock<Rules> = OnceLock::new();
    RULES.get_or_init(|| Rules {
        source_rpm: Regex::new(r"\.src\.rpm$").expect("valid pattern"),
        debug_rpm: Regex::new(r"-debug(?:info|source)-.+\.rpm$").expect("valid pattern"),
        rpm: Regex::new(r"\.rpm$").expect("valid pattern"),
        image: Regex::new(r"\.(?:iso|raw\.xz|qcow2|tar\.xz)$").expect("valid pattern"),
    })
}

fn is_plain_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains('/')
        && !value.contains('\\')
        && !value.contains('\0')
}

/// Where an uploaded artifact belongs, derived from its name.
///
/// Names that do not look like a package or an image are rejected before any
/// byte is written.
pub fn upload_destination(
    storage: &StorageConfig,
    file_name: &str,
    release: &str,
    arch: &str,
) -> TransferResult<PathBuf> {
    if !is_plain_component(file_name) || file_name.contains("..") {
        return Err(TransferError::InvalidName(file_name.to_string()));
    }
    if !is_plain_component(release) || !is_plain_component(arch) {
        return Err(TransferError::Protocol(format!(
            "invalid release \"{}\" or architecture \"{}\" for {}",
            release, arch, file_name
        )));
    }

    let letter = file_name
        .chars()
        .next()
        .map(|c| c.to_ascii_lowercase().to_string())
        .unwrap_or_default();
    let everything = storage
        .staging_repo_dir
        .join("fedora")
        .join("releases")
        .join(release)
        .join("Everything");

    let rules = rules();
    let dir = if rules.source_rpm.is_match(file_name) {
        everything.join("source").join("SRPMS").join(&letter)
    } else if rules.debug_rpm.is_match(file_name) {
        everything.join(arch).join("debug").join("Packages").join(&letter)
    } else if rules.rpm.is_match(file_name) {
        everything.join(arch).join("os").join("Packages").join(&letter)
    } else if rules.image.is_match(file_name) {
        storage.images_dir.join(release).join(arch)
    } else {
        return Err(TransferError::InvalidName(file_name.to_string()));
    };
    Ok(dir.join(file_name))
}

/// Resolve a download request relative to `root`.
pub fn resolve_download(root: &Path, file_name: &str) -> TransferResult<PathBuf> {
    let relative = Path::new(file_name);
    if file_name.is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(TransferError::InvalidName(file_name.to_string()));
    }
    Ok(root.join(relative))
}

// ----- sending ------------------------------------------------------------------

/// Reads a file in [`CHUNK_SIZE`] pieces while hashing it.
pub struct ChunkReader {
    file: File,
    hasher: Sha256,
    size: u64,
    buffer: Vec<u8>,
}

impl ChunkReader {
    pub async fn open(path: &Path) -> TransferResult<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            file,
            hasher: Sha256::new(),
            size: 0,
            buffer: vec![0; CHUNK_SIZE],
        })
    }

    /// Next chunk, or `None` at end of file. Chunks are full-sized except
    /// for the last one.
    pub async fn next_chunk(&mut self) -> TransferResult<Option<Vec<u8>>> {
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            let n = self.file.read(&mut self.buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        let chunk = self.buffer[..filled].to_vec();
        self.hasher.update(&chunk);
        self.size += filled as u64;
        Ok(Some(chunk))
    }

    pub fn finish(self) -> Trailer {
        Trailer {
            hash: hex::encode(self.hasher.finalize()),
            size: self.size,
        }
    }
}

// ----- receiving ----------------------------------------------------------------

/// Writes incoming chunks to a temporary sibling of the destination and
/// renames it into place once the trailer checks out.
pub struct IntegrityWriter {
    destination: PathBuf,
    partial: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    written: u64,
}

impl IntegrityWriter {
    pub async fn create(destination: PathBuf) -> TransferResult<Self> {
        let parent = destination
            .parent()
            .ok_or_else(|| TransferError::InvalidName(destination.display().to_string()))?;
        fs::create_dir_all(parent).await?;

        let partial = parent.join(format!(
            ".{}.part-{}",
            file_label(&destination),
            uuid::Uuid::new_v4()
        ));
        let file = File::create(&partial).await?;
        Ok(Self {
            destination,
            partial,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, data: &[u8]) -> TransferResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::Protocol("write after end of transfer".to_string()))?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Check the trailer and move the file into place. On any mismatch the
    /// partial file is removed and the destination is left untouched.
    pub async fn commit(
        mut self,
        expected: &Trailer,
        permission: Option<u32>,
    ) -> TransferResult<u64> {
        let Some(mut file) = self.file.take() else {
            return Err(TransferError::Protocol("transfer already finished".to_string()));
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let label = file_label(&self.destination);
        let actual = hex::encode(self.hasher.clone().finalize());
        if !actual.eq_ignore_ascii_case(expected.hash.trim()) {
            self.discard().await;
            return Err(TransferError::HashMismatch {
                file: label,
                expected: expected.hash.clone(),
                actual,
            });
        }
        if self.written != expected.size {
            self.discard().await;
            return Err(TransferError::SizeMismatch {
                file: label,
                expected: expected.size,
                actual: self.written,
            });
        }

        let mode = permission.filter(|m| *m != 0).unwrap_or(DEFAULT_PERMISSION);
        fs::set_permissions(&self.partial, std::fs::Permissions::from_mode(mode)).await?;
        fs::rename(&self.partial, &self.destination).await?;
        tracing::debug!(
            path = %self.destination.display(),
            bytes = self.written,
            "Transfer committed"
        );
        Ok(self.written)
    }

    /// Drop whatever was written so far.
    pub async fn abort(mut self) {
        self.file.take();
        self.discard().await;
    }

    async fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.partial.display(), error = %e, "Failed to remove partial file");
            }
        }
    }
}

/// Collapse the outcome of concurrent transfers into one result. Every
/// transfer has finished by the time this is called; the first failure is
/// the one reported.
pub fn aggregate<T>(results: Vec<TransferResult<T>>) -> TransferResult<Vec<T>> {
    let total = results.len();
    let mut values = Vec::with_capacity(total);
    let mut first = None;
    let mut failed = 0;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                failed += 1;
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
    }
    match first {
        None => Ok(values),
        Some(e) if total == 1 => Err(e),
        Some(e) => Err(TransferError::Aggregate {
            failed,
            total,
            first: Box::new(e),
        }),
    }
}
