//! Durable ledger backed by an embedded redb database.
//!
//! Every collection is a redb table. redb allows a single writer and any
//! number of concurrent readers, so read paths never block each other and
//! every write is one atomic transaction.

pub mod records;
pub mod tables;

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::scheduler::Job;
pub use records::{Chroot, Image, Package, VcsInfo};
use records::merge_architectures;
use tables::*;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{collection} \"{key}\" not found")]
    NotFound {
        collection: &'static str,
        key: String,
    },

    #[error("failed to prepare ledger directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

fn encode<T: Serialize>(value: &T) -> LedgerResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> LedgerResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Handle to the ledger. Cheap to clone.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open (or create) the ledger file and make sure every collection exists.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(redb::Error::from)?;

        let txn = db.begin_write().map_err(redb::Error::from)?;
        {
            txn.open_table(JOBS).map_err(redb::Error::from)?;
            txn.open_table(PACKAGES).map_err(redb::Error::from)?;
            txn.open_table(IMAGES).map_err(redb::Error::from)?;
            txn.open_table(CHROOTS).map_err(redb::Error::from)?;
            txn.open_table(DATA).map_err(redb::Error::from)?;
            txn.open_table(SEQUENCES).map_err(redb::Error::from)?;
        }
        txn.commit().map_err(redb::Error::from)?;

        tracing::debug!(path = %path.display(), "Ledger opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Run `op` on the blocking thread pool.
    ///
    /// Every write transaction syncs to disk on commit; async callers go
    /// through here instead of stalling a runtime worker.
    pub async fn blocking<T, F>(&self, op: F) -> LedgerResult<T>
    where
        F: FnOnce(&Ledger) -> LedgerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || op(&ledger)).await?
    }

    /// Store a job from async code.
    pub async fn persist_job(&self, job: &Job) -> LedgerResult<()> {
        let job = job.clone();
        self.blocking(move |ledger| ledger.save_job(&job)).await
    }

    // ----- sequences -------------------------------------------------------

    fn next_id(&self, sequence: &str) -> LedgerResult<u64> {
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        let next = {
            let mut table = txn.open_table(SEQUENCES).map_err(redb::Error::from)?;
            let last = table
                .get(sequence)
                .map_err(redb::Error::from)?
                .map(|v| v.value())
                .unwrap_or(0);
            let next = last + 1;
            table.insert(sequence, next).map_err(redb::Error::from)?;
            next
        };
        txn.commit().map_err(redb::Error::from)?;
        Ok(next)
    }

    /// Allocate a new globally unique job id.
    pub fn next_job_id(&self) -> LedgerResult<u64> {
        self.next_id(JOB_SEQUENCE)
    }

    /// Allocate a new worker id.
    pub fn next_worker_id(&self) -> LedgerResult<u64> {
        self.next_id(SLAVE_SEQUENCE)
    }

    pub fn last_job_id(&self) -> LedgerResult<u64> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(SEQUENCES).map_err(redb::Error::from)?;
        let last = table
            .get(JOB_SEQUENCE)
            .map_err(redb::Error::from)?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(last)
    }

    // ----- jobs ------------------------------------------------------------

    pub fn save_job(&self, job: &Job) -> LedgerResult<()> {
        let encoded = encode(job)?;
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = txn.open_table(JOBS).map_err(redb::Error::from)?;
            table
                .insert(job.id, encoded.as_slice())
                .map_err(redb::Error::from)?;
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    pub fn get_job(&self, id: u64) -> LedgerResult<Option<Job>> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(JOBS).map_err(redb::Error::from)?;
        let value = table.get(id).map_err(redb::Error::from)?;
        value.map(|v| decode(v.value())).transpose()
    }

    /// Jobs matching `filter`, in id order.
    pub fn filter_jobs<F>(&self, mut filter: F) -> LedgerResult<Vec<Job>>
    where
        F: FnMut(&Job) -> bool,
    {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(JOBS).map_err(redb::Error::from)?;
        let mut jobs = Vec::new();
        for entry in table.iter().map_err(redb::Error::from)? {
            let (_, value) = entry.map_err(redb::Error::from)?;
            let job: Job = decode(value.value())?;
            if filter(&job) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub fn list_jobs(&self) -> LedgerResult<Vec<Job>> {
        self.filter_jobs(|_| true)
    }

    /// Jobs created but never handed to a worker, in id order.
    pub fn undispatched_jobs(&self) -> LedgerResult<Vec<Job>> {
        self.filter_jobs(|job| job.status.is_undispatched())
    }

    pub fn job_count(&self) -> LedgerResult<u64> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(JOBS).map_err(redb::Error::from)?;
        Ok(table.len().map_err(redb::Error::from)?)
    }

    // ----- packages --------------------------------------------------------

    /// Add or update a package. Architectures accumulate across updates;
    /// every other field is replaced.
    pub fn add_package(&self, pkg: &Package) -> LedgerResult<Package> {
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        let stored = {
            let mut table = txn.open_table(PACKAGES).map_err(redb::Error::from)?;
            let previous: Option<Package> = table
                .get(pkg.name.as_str())
                .map_err(redb::Error::from)?
                .map(|v| decode(v.value()))
                .transpose()?;

            let mut stored = pkg.clone();
            if let Some(previous) = previous {
                stored.architectures =
                    merge_architectures(&previous.architectures, &pkg.architectures);
            }
            let encoded = encode(&stored)?;
            table
                .insert(stored.name.as_str(), encoded.as_slice())
                .map_err(redb::Error::from)?;
            stored
        };
        register_architectures(&txn, &stored.architectures)?;
        txn.commit().map_err(redb::Error::from)?;
        Ok(stored)
    }

    pub fn get_package(&self, name: &str) -> LedgerResult<Option<Package>> {
        self.get_record(PACKAGES, name)
    }

    pub fn has_package(&self, name: &str) -> LedgerResult<bool> {
        Ok(self.get_package(name)?.is_some())
    }

    pub fn list_packages(&self) -> LedgerResult<Vec<Package>> {
        self.list_records(PACKAGES)
    }

    /// Remove a package and prune architectures nothing references anymore.
    pub fn remove_package(&self, name: &str) -> LedgerResult<()> {
        self.remove_target(PACKAGES, "package", name, |bytes| {
            decode::<Package>(bytes).map(|p| p.architectures)
        })
    }

    // ----- images ----------------------------------------------------------

    /// Add or update an image. Same merge rules as [`Ledger::add_package`].
    pub fn add_image(&self, img: &Image) -> LedgerResult<Image> {
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        let stored = {
            let mut table = txn.open_table(IMAGES).map_err(redb::Error::from)?;
            let previous: Option<Image> = table
                .get(img.name.as_str())
                .map_err(redb::Error::from)?
                .map(|v| decode(v.value()))
                .transpose()?;

            let mut stored = img.clone();
            if let Some(previous) = previous {
                stored.architectures =
                    merge_architectures(&previous.architectures, &img.architectures);
            }
            let encoded = encode(&stored)?;
            table
                .insert(stored.name.as_str(), encoded.as_slice())
                .map_err(redb::Error::from)?;
            stored
        };
        register_architectures(&txn, &stored.architectures)?;
        txn.commit().map_err(redb::Error::from)?;
        Ok(stored)
    }

    pub fn get_image(&self, name: &str) -> LedgerResult<Option<Image>> {
        self.get_record(IMAGES, name)
    }

    pub fn has_image(&self, name: &str) -> LedgerResult<bool> {
        Ok(self.get_image(name)?.is_some())
    }

    pub fn list_images(&self) -> LedgerResult<Vec<Image>> {
        self.list_records(IMAGES)
    }

    pub fn remove_image(&self, name: &str) -> LedgerResult<()> {
        self.remove_target(IMAGES, "image", name, |bytes| {
            decode::<Image>(bytes).map(|i| i.architectures)
        })
    }

    // ----- chroots ---------------------------------------------------------

    pub fn add_chroot(&self, chroot: &Chroot) -> LedgerResult<()> {
        let encoded = encode(chroot)?;
        let name = chroot.name();
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = txn.open_table(CHROOTS).map_err(redb::Error::from)?;
            table
                .insert(name.as_str(), encoded.as_slice())
                .map_err(redb::Error::from)?;
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    pub fn get_chroot(&self, release: &str, version: &str, arch: &str) -> LedgerResult<Option<Chroot>> {
        self.get_record(CHROOTS, &Chroot::key(release, version, arch))
    }

    pub fn list_chroots(&self) -> LedgerResult<Vec<Chroot>> {
        self.list_records(CHROOTS)
    }

    pub fn list_active_chroots(&self) -> LedgerResult<Vec<Chroot>> {
        Ok(self
            .list_chroots()?
            .into_iter()
            .filter(|c| c.active)
            .collect())
    }

    pub fn remove_chroot(&self, release: &str, version: &str, arch: &str) -> LedgerResult<()> {
        let key = Chroot::key(release, version, arch);
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        let removed = {
            let mut table = txn.open_table(CHROOTS).map_err(redb::Error::from)?;
            let removed = table
                .remove(key.as_str())
                .map_err(redb::Error::from)?
                .is_some();
            removed
        };
        if !removed {
            return Err(LedgerError::NotFound {
                collection: "chroot",
                key,
            });
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    // ----- architecture registry -------------------------------------------

    pub fn list_architectures(&self) -> LedgerResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(DATA).map_err(redb::Error::from)?;
        let value = table.get(ARCHS_KEY).map_err(redb::Error::from)?;
        Ok(value
            .map(|v| decode(v.value()))
            .transpose()?
            .unwrap_or_default())
    }

    // ----- helpers ---------------------------------------------------------

    fn get_record<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
    ) -> LedgerResult<Option<T>> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(definition).map_err(redb::Error::from)?;
        let value = table.get(key).map_err(redb::Error::from)?;
        value.map(|v| decode(v.value())).transpose()
    }

    fn list_records<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> LedgerResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(definition).map_err(redb::Error::from)?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(redb::Error::from)? {
            let (_, value) = entry.map_err(redb::Error::from)?;
            records.push(decode(value.value())?);
        }
        Ok(records)
    }

    fn remove_target<F>(
        &self,
        definition: TableDefinition<'static, &'static str, &'static [u8]>,
        collection: &'static str,
        name: &str,
        architectures_of: F,
    ) -> LedgerResult<()>
    where
        F: Fn(&[u8]) -> LedgerResult<Vec<String>>,
    {
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        let archs = {
            let mut table = txn.open_table(definition).map_err(redb::Error::from)?;
            let removed = table.remove(name).map_err(redb::Error::from)?;
            match removed {
                Some(value) => architectures_of(value.value())?,
                None => {
                    return Err(LedgerError::NotFound {
                        collection,
                        key: name.to_string(),
                    })
                }
            }
        };
        prune_architectures(&txn, &archs)?;
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }
}

fn read_architectures(txn: &redb::WriteTransaction) -> LedgerResult<Vec<String>> {
    let table = txn.open_table(DATA).map_err(redb::Error::from)?;
    let value = table.get(ARCHS_KEY).map_err(redb::Error::from)?;
    Ok(value
        .map(|v| decode(v.value()))
        .transpose()?
        .unwrap_or_default())
}

fn write_architectures(txn: &redb::WriteTransaction, archs: &[String]) -> LedgerResult<()> {
    let encoded = encode(&archs)?;
    let mut table = txn.open_table(DATA).map_err(redb::Error::from)?;
    table
        .insert(ARCHS_KEY, encoded.as_slice())
        .map_err(redb::Error::from)?;
    Ok(())
}

fn register_architectures(txn: &redb::WriteTransaction, archs: &[String]) -> LedgerResult<()> {
    let saved = read_architectures(txn)?;
    let merged = merge_architectures(&saved, archs);
    if merged.len() != saved.len() {
        write_architectures(txn, &merged)?;
    }
    Ok(())
}

/// Drop the given architectures from the registry unless a remaining package
/// or image still lists them.
fn prune_architectures(txn: &redb::WriteTransaction, candidates: &[String]) -> LedgerResult<()> {
    let mut referenced: Vec<String> = Vec::new();
    {
        let packages = txn.open_table(PACKAGES).map_err(redb::Error::from)?;
        for entry in packages.iter().map_err(redb::Error::from)? {
            let (_, value) = entry.map_err(redb::Error::from)?;
            let pkg: Package = decode(value.value())?;
            referenced.extend(pkg.architectures);
        }
        let images = txn.open_table(IMAGES).map_err(redb::Error::from)?;
        for entry in images.iter().map_err(redb::Error::from)? {
            let (_, value) = entry.map_err(redb::Error::from)?;
            let img: Image = decode(value.value())?;
            referenced.extend(img.architectures);
        }
    }

    let saved = read_architectures(txn)?;
    let kept: Vec<String> = saved
        .iter()
        .filter(|arch| !candidates.contains(arch) || referenced.contains(arch))
        .cloned()
        .collect();
    if kept.len() != saved.len() {
        tracing::debug!(
            removed = ?saved.iter().filter(|a| !kept.contains(a)).collect::<Vec<_>>(),
            "Pruned unreferenced architectures"
        );
        write_architectures(txn, &kept)?;
    }
    Ok(())
}
