//! Time-partitioned storage engine for hygro sensor readings.
//!
//! Two interchangeable backends implement [`StorageBackend`]:
//!
//! - [`IndexedStore`]: a single SQLite file with secondary indexes, WAL
//!   journaling and batched inserts.
//! - [`PartitionedFileStore`]: one directory per time partition holding
//!   bounded JSON-lines segments per device, gzip-compressed once cold.
//!
//! Background maintenance is split into [`RetentionSweeper`] and
//! [`CompactionSweeper`], both driven by a single `run_once(now)` call so a
//! scheduler (or a test) decides when they run. [`MigrationCoordinator`]
//! copies a file store into another backend and verifies the result.
//!
//! # Example
//!
//! ```no_run
//! use hygro_store::{IndexedStore, StorageBackend};
//! use hygro_types::TimeRange;
//!
//! let store = IndexedStore::open_default()?;
//! let range = TimeRange::parse_rfc3339(Some("2024-05-01T00:00:00Z"), None).unwrap();
//! let readings = store.query("A4:C1:38:00:11:22", range)?;
//! # Ok::<(), hygro_store::Error>(())
//! ```

mod backend;
mod compaction;
mod error;
mod file_store;
mod indexed;
mod migration;
mod partition;
mod queries;
mod retention;
mod schema;
mod segment;

pub use backend::{BackendKind, StorageBackend};
pub use compaction::{CompactionOutcome, CompactionSweeper};
pub use error::{Error, Result};
pub use file_store::{
    COMPACTED_MARKER, DEFAULT_MAX_READINGS_PER_FILE, FileStoreOptions, PartitionEntry,
    PartitionedFileStore,
};
pub use indexed::IndexedStore;
pub use migration::{
    DEFAULT_CHUNK_SIZE, DeviceMismatch, DeviceTally, MigrationCoordinator, MigrationError,
    MigrationOptions, MigrationPhase, MigrationReport, ScanPlan, ScanUnit, SourceSummary,
    reading_digest,
};
pub use partition::{Granularity, PartitionId, PartitionResolver};
pub use queries::ReadingQuery;
pub use retention::{RetentionOutcome, RetentionSweeper};
pub use segment::{SegmentName, device_key};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/hygro/readings.db`
/// - macOS: `~/Library/Application Support/hygro/readings.db`
/// - Windows: `C:\Users\<user>\AppData\Local\hygro\readings.db`
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join("readings.db")
}

/// Default root of the partitioned file store.
pub fn default_partition_root() -> std::path::PathBuf {
    default_data_dir().join("partitions")
}

fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("hygro")
}
