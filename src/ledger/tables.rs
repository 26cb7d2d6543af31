//! redb table definitions for the coordinator ledger.
//!
//! Values are JSON-serialized records except for the sequence counters.

use redb::TableDefinition;

/// Job records keyed by job id.
pub const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("job");

/// Package records keyed by package name.
pub const PACKAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("package");

/// Image records keyed by image name.
pub const IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("image");

/// Chroot descriptors keyed by `{release}-{version}-{arch}`.
pub const CHROOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("chroot");

/// Miscellaneous data. Holds the architecture registry under [`ARCHS_KEY`].
pub const DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("data");

/// Monotonic counters keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub const ARCHS_KEY: &str = "archs";
pub const JOB_SEQUENCE: &str = "job";
pub const SLAVE_SEQUENCE: &str = "slave";
