//! One-shot migration runner.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hygro_store::{
    MigrationCoordinator, MigrationError, MigrationOptions, MigrationReport, PartitionedFileStore,
    StorageBackend,
};

use crate::config::StorageConfig;

/// Copy the file store at `source` into `dest` and verify the result.
///
/// The source is opened with the partition settings of `storage`, which
/// only affect how its partition directories are interpreted. Mismatches
/// are logged per device and returned in the report; they are not errors.
pub fn run_migration(
    source: &Path,
    storage: &StorageConfig,
    dest: &dyn StorageBackend,
    options: MigrationOptions,
    cancel: CancellationToken,
) -> Result<MigrationReport, MigrationError> {
    if !source.is_dir() {
        return Err(MigrationError::Storage(hygro_store::Error::Io(
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("migration source {} is not a directory", source.display()),
            ),
        )));
    }

    let source = PartitionedFileStore::open(source, storage.file_store_options())?;
    let report = MigrationCoordinator::new(&source, dest, options)
        .with_cancellation(cancel)
        .run()?;

    for mismatch in &report.mismatches {
        warn!(
            "{}: {} readings in source, {} in destination",
            mismatch.device_addr, mismatch.source_count, mismatch.dest_count
        );
    }
    info!(
        "Migrated {} readings of {} devices ({} new, {} segments skipped)",
        report.summary.readings,
        report.summary.devices.len(),
        report.summary.inserted,
        report.summary.segments_skipped
    );
    Ok(report)
}
