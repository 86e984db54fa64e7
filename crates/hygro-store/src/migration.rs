//! One-shot migration from the partitioned file store into another backend.
//!
//! The coordinator walks three phases:
//!
//! 1. **Scanning** lists every partition and device segment under the source root.
//! 2. **Copying** decodes one `(partition, device)` unit at a time and writes it
//!    to the destination in fixed-size chunks.
//! 3. **Verifying** compares per-device counts, and optionally checksums,
//!    between what was read and what the destination now holds.
//!
//! The source is never modified. Chunks already committed stay in the
//! destination when a later chunk fails; re-running is safe because the
//! indexed backend ignores readings whose identity
//! `(device_addr, timestamp, client_id)` is already stored.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hygro_types::{Reading, TimeRange};

use crate::backend::StorageBackend;
use crate::error::Error;
use crate::file_store::{PartitionEntry, PartitionedFileStore};

/// Default number of readings written per destination chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// States of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Scanning,
    Copying,
    Verifying,
    Succeeded,
    Failed,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationPhase::Scanning => "scanning",
            MigrationPhase::Copying => "copying",
            MigrationPhase::Verifying => "verifying",
            MigrationPhase::Succeeded => "succeeded",
            MigrationPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tuning for a migration run.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Readings per destination write.
    pub chunk_size: usize,
    /// Compare content checksums in addition to counts.
    pub verify_checksum: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_checksum: true,
        }
    }
}

/// Errors that abort a migration.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Listing the source or reading back the destination failed.
    #[error("Storage error: {0}")]
    Storage(#[from] Error),

    /// Writing a chunk to the destination failed.
    #[error(
        "Chunk {chunk} of device {device} in partition {partition} failed \
         (last committed chunk: {last_committed:?}): {source}"
    )]
    ChunkFailed {
        partition: String,
        device: String,
        /// Chunk index within the device's unit.
        chunk: usize,
        /// Global index of the last chunk committed before the failure.
        last_committed: Option<usize>,
        #[source]
        source: Error,
    },

    /// The cancellation token fired between units of work.
    #[error("Migration cancelled")]
    Cancelled,
}

/// Segments of one device in one source partition.
#[derive(Debug, Clone)]
pub struct ScanUnit {
    pub partition: PartitionEntry,
    pub device_key: String,
    /// Segment files found at scan time, compressed ones included.
    pub segments: usize,
}

/// Output of the scanning phase.
#[derive(Debug, Clone, Default)]
pub struct ScanPlan {
    pub units: Vec<ScanUnit>,
    /// Partitions whose directory could not be listed.
    pub skipped_partitions: usize,
}

impl ScanPlan {
    pub fn segment_count(&self) -> usize {
        self.units.iter().map(|u| u.segments).sum()
    }
}

/// Per-device tally of what was read from the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceTally {
    pub count: u64,
    pub checksum: u64,
}

impl DeviceTally {
    fn push(&mut self, reading: &Reading) {
        self.count += 1;
        self.checksum = self.checksum.wrapping_add(reading_digest(reading));
    }
}

/// Output of the copying phase.
#[derive(Debug, Clone, Default)]
pub struct SourceSummary {
    pub devices: BTreeMap<String, DeviceTally>,
    /// Readings decoded from the source after removing repeated identities.
    pub readings: u64,
    /// Readings the destination reported as newly stored.
    pub inserted: u64,
    pub chunks: usize,
    pub segments_read: usize,
    pub segments_skipped: usize,
}

/// A device whose destination contents differ from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMismatch {
    pub device_addr: String,
    pub source_count: u64,
    pub dest_count: u64,
    pub source_checksum: Option<u64>,
    pub dest_checksum: Option<u64>,
}

impl DeviceMismatch {
    /// Readings present in the source but missing from the destination.
    pub fn missing(&self) -> i64 {
        self.source_count as i64 - self.dest_count as i64
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub summary: SourceSummary,
    pub mismatches: Vec<DeviceMismatch>,
    pub elapsed: Duration,
}

impl MigrationReport {
    /// `Succeeded` when verification found no mismatch, else `Failed`.
    pub fn phase(&self) -> MigrationPhase {
        if self.mismatches.is_empty() {
            MigrationPhase::Succeeded
        } else {
            MigrationPhase::Failed
        }
    }
}

/// Content digest of one reading; summed per device for verification.
///
/// Timestamps are hashed as Unix nanoseconds so that an offset change
/// between backends does not count as a difference.
pub fn reading_digest(reading: &Reading) -> u64 {
    let mut hasher = DefaultHasher::new();
    reading.device_addr.hash(&mut hasher);
    reading.device_name.hash(&mut hasher);
    reading.timestamp.unix_timestamp_nanos().hash(&mut hasher);
    for value in [
        reading.temp_c,
        reading.temp_f,
        reading.humidity,
        reading.dew_point_c,
        reading.abs_humidity,
        reading.steam_pressure,
    ] {
        value.to_bits().hash(&mut hasher);
    }
    reading.battery.hash(&mut hasher);
    reading.rssi.hash(&mut hasher);
    reading.client_id.hash(&mut hasher);
    hasher.finish()
}

/// Copies a [`PartitionedFileStore`] into another backend and verifies the result.
pub struct MigrationCoordinator<'a> {
    source: &'a PartitionedFileStore,
    dest: &'a dyn StorageBackend,
    options: MigrationOptions,
    cancel: CancellationToken,
}

impl<'a> MigrationCoordinator<'a> {
    pub fn new(
        source: &'a PartitionedFileStore,
        dest: &'a dyn StorageBackend,
        options: MigrationOptions,
    ) -> Self {
        Self {
            source,
            dest,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between partitions and chunks once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self) -> Result<(), MigrationError> {
        if self.cancel.is_cancelled() {
            Err(MigrationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Enumerate every partition and device segment group in the source.
    pub fn scan(&self) -> Result<ScanPlan, MigrationError> {
        let mut plan = ScanPlan::default();
        for partition in self.source.partitions()? {
            self.check_cancelled()?;
            let segments = match self.source.segments(&partition) {
                Ok(segments) => segments,
                Err(e) => {
                    warn!("Skipping unreadable partition {}: {}", partition.id, e);
                    plan.skipped_partitions += 1;
                    continue;
                }
            };

            let mut per_key: BTreeMap<String, usize> = BTreeMap::new();
            for segment in segments {
                *per_key.entry(segment.device_key).or_default() += 1;
            }
            for (device_key, segments) in per_key {
                plan.units.push(ScanUnit {
                    partition: partition.clone(),
                    device_key,
                    segments,
                });
            }
        }
        Ok(plan)
    }

    /// Decode each unit of `plan` and write it to the destination in chunks.
    pub fn copy(&self, plan: &ScanPlan) -> Result<SourceSummary, MigrationError> {
        let chunk_size = self.options.chunk_size.max(1);
        let mut summary = SourceSummary::default();
        let mut last_committed: Option<usize> = None;

        for unit in &plan.units {
            self.check_cancelled()?;
            let read = match self.source.read_device(&unit.partition, &unit.device_key) {
                Ok(read) => read,
                Err(e) => {
                    warn!(
                        "Skipping {} in partition {}: {}",
                        unit.device_key, unit.partition.id, e
                    );
                    summary.segments_skipped += unit.segments;
                    continue;
                }
            };
            summary.segments_read += read.segments;
            summary.segments_skipped += read.skipped;

            let mut readings = read.readings;
            let mut seen = HashSet::with_capacity(readings.len());
            readings.retain(|r| {
                seen.insert((r.device_addr.clone(), r.timestamp, r.client_id.clone()))
            });
            readings.sort_by_key(|r| r.timestamp);

            for reading in &readings {
                summary
                    .devices
                    .entry(reading.device_addr.clone())
                    .or_default()
                    .push(reading);
            }
            summary.readings += readings.len() as u64;

            for (chunk, batch) in readings.chunks(chunk_size).enumerate() {
                self.check_cancelled()?;
                match self.dest.write_batch(batch) {
                    Ok(inserted) => {
                        summary.inserted += inserted as u64;
                        last_committed = Some(summary.chunks);
                        summary.chunks += 1;
                    }
                    Err(source) => {
                        return Err(MigrationError::ChunkFailed {
                            partition: unit.partition.id.to_string(),
                            device: unit.device_key.clone(),
                            chunk,
                            last_committed,
                            source,
                        });
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Compare every source device against the destination.
    pub fn verify(&self, summary: &SourceSummary) -> Result<Vec<DeviceMismatch>, MigrationError> {
        let mut mismatches = Vec::new();
        for (device_addr, tally) in &summary.devices {
            let dest_count = self.dest.count(device_addr)?;
            let (source_checksum, dest_checksum) = if self.options.verify_checksum {
                let dest_checksum = self
                    .dest
                    .query(device_addr, TimeRange::ALL)?
                    .iter()
                    .fold(0u64, |acc, r| acc.wrapping_add(reading_digest(r)));
                (Some(tally.checksum), Some(dest_checksum))
            } else {
                (None, None)
            };

            if dest_count != tally.count || source_checksum != dest_checksum {
                warn!(
                    "Verification mismatch for {}: source {} readings, destination {}",
                    device_addr, tally.count, dest_count
                );
                mismatches.push(DeviceMismatch {
                    device_addr: device_addr.clone(),
                    source_count: tally.count,
                    dest_count,
                    source_checksum,
                    dest_checksum,
                });
            }
        }
        Ok(mismatches)
    }

    /// Walk scan, copy and verify.
    pub fn run(&self) -> Result<MigrationReport, MigrationError> {
        let started = Instant::now();

        info!(
            "Migration {}: {} into {} backend",
            MigrationPhase::Scanning,
            self.source.root().display(),
            self.dest.kind()
        );
        let plan = self.scan()?;

        info!(
            "Migration {}: {} segments in {} units",
            MigrationPhase::Copying,
            plan.segment_count(),
            plan.units.len()
        );
        let summary = self.copy(&plan)?;

        info!(
            "Migration {}: {} devices, {} readings",
            MigrationPhase::Verifying,
            summary.devices.len(),
            summary.readings
        );
        let mismatches = self.verify(&summary)?;

        let report = MigrationReport {
            summary,
            mismatches,
            elapsed: started.elapsed(),
        };
        info!(
            "Migration {} in {:?}: {} inserted, {} mismatches",
            report.phase(),
            report.elapsed,
            report.summary.inserted,
            report.mismatches.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::FileStoreOptions;
    use crate::indexed::IndexedStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn populated(dir: &std::path::Path) -> PartitionedFileStore {
        let store = PartitionedFileStore::open(
            dir,
            FileStoreOptions {
                max_readings_per_file: 7,
                ..Default::default()
            },
        )
        .unwrap();
        let readings: Vec<_> = (0..30)
            .map(|i| {
                Reading::new(
                    "A4:C1:38:00:11:22",
                    datetime!(2024-05-01 20:00 UTC) + time::Duration::minutes(15 * i),
                    20.0,
                    50.0,
                )
            })
            .collect();
        store.write_batch(&readings).unwrap();
        store
    }

    /// Delegates to an indexed store but rejects batches after a budget.
    struct FailingBackend {
        inner: IndexedStore,
        budget: AtomicUsize,
    }

    impl StorageBackend for FailingBackend {
        fn kind(&self) -> crate::BackendKind {
            self.inner.kind()
        }
        fn write(&self, reading: &Reading) -> crate::Result<()> {
            self.inner.write(reading)
        }
        fn write_batch(&self, readings: &[Reading]) -> crate::Result<usize> {
            if self.budget.fetch_sub(1, Ordering::SeqCst) == 0 {
                self.budget.store(0, Ordering::SeqCst);
                return Err(Error::Closed);
            }
            self.inner.write_batch(readings)
        }
        fn query(&self, device_addr: &str, range: TimeRange) -> crate::Result<Vec<Reading>> {
            self.inner.query(device_addr, range)
        }
        fn devices(&self) -> crate::Result<Vec<String>> {
            self.inner.devices()
        }
        fn prune_before(&self, cutoff: OffsetDateTime) -> crate::Result<u64> {
            self.inner.prune_before(cutoff)
        }
        fn purge_device(&self, device_addr: &str) -> crate::Result<u64> {
            self.inner.purge_device(device_addr)
        }
        fn close(&self) -> crate::Result<()> {
            self.inner.close()
        }
    }

    #[test]
    fn test_scan_groups_segments_by_device() {
        let dir = tempfile::tempdir().unwrap();
        let source = populated(dir.path());
        let dest = IndexedStore::open_in_memory().unwrap();

        let plan = MigrationCoordinator::new(&source, &dest, MigrationOptions::default())
            .scan()
            .unwrap();
        // 20:00..03:15 spans two daily partitions: 16 + 14 readings.
        assert_eq!(plan.units.len(), 2);
        assert_eq!(plan.segment_count(), 3 + 2);
    }

    #[test]
    fn test_run_copies_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let source = populated(dir.path());
        let dest = IndexedStore::open_in_memory().unwrap();
        let options = MigrationOptions {
            chunk_size: 4,
            ..Default::default()
        };

        let report = MigrationCoordinator::new(&source, &dest, options).run().unwrap();
        assert_eq!(report.phase(), MigrationPhase::Succeeded);
        assert_eq!(report.summary.readings, 30);
        assert_eq!(report.summary.inserted, 30);
        assert_eq!(report.summary.chunks, 4 + 4);
        assert_eq!(dest.count("A4:C1:38:00:11:22").unwrap(), 30);
    }

    #[test]
    fn test_rerun_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let source = populated(dir.path());
        let dest = IndexedStore::open_in_memory().unwrap();
        let coordinator = MigrationCoordinator::new(&source, &dest, MigrationOptions::default());

        coordinator.run().unwrap();
        let report = coordinator.run().unwrap();
        assert_eq!(report.summary.inserted, 0);
        assert!(report.mismatches.is_empty());
        assert_eq!(dest.count("A4:C1:38:00:11:22").unwrap(), 30);
    }

    #[test]
    fn test_chunk_failure_keeps_committed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let source = populated(dir.path());
        let dest = FailingBackend {
            inner: IndexedStore::open_in_memory().unwrap(),
            budget: AtomicUsize::new(2),
        };
        let options = MigrationOptions {
            chunk_size: 5,
            ..Default::default()
        };

        let err = MigrationCoordinator::new(&source, &dest, options).run().unwrap_err();
        match err {
            MigrationError::ChunkFailed {
                partition,
                chunk,
                last_committed,
                ..
            } => {
                assert_eq!(partition, "2024-05-01");
                assert_eq!(chunk, 2);
                assert_eq!(last_committed, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dest.inner.count("A4:C1:38:00:11:22").unwrap(), 10);
    }

    #[test]
    fn test_cancelled_before_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = populated(dir.path());
        let dest = IndexedStore::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        let coordinator = MigrationCoordinator::new(&source, &dest, MigrationOptions::default())
            .with_cancellation(cancel.clone());

        let plan = coordinator.scan().unwrap();
        cancel.cancel();
        assert!(matches!(coordinator.copy(&plan), Err(MigrationError::Cancelled)));
        assert_eq!(dest.count("A4:C1:38:00:11:22").unwrap(), 0);
    }

    #[test]
    fn test_checksum_detects_altered_reading() {
        let dir = tempfile::tempdir().unwrap();
        let source = populated(dir.path());
        let dest = IndexedStore::open_in_memory().unwrap();
        let coordinator = MigrationCoordinator::new(&source, &dest, MigrationOptions::default());

        let summary = coordinator.copy(&coordinator.scan().unwrap()).unwrap();
        let first = dest.query("A4:C1:38:00:11:22", TimeRange::ALL).unwrap().remove(0);
        dest.delete_reading(&first.device_addr, first.timestamp).unwrap();
        dest.write(&Reading::new(&first.device_addr, first.timestamp, 99.0, 50.0))
            .unwrap();

        let mismatches = coordinator.verify(&summary).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].missing(), 0);
        assert_ne!(mismatches[0].source_checksum, mismatches[0].dest_checksum);
    }

    #[test]
    fn test_digest_ignores_offset() {
        let r = Reading::new("AA", datetime!(2024-05-01 12:00 UTC), 20.0, 40.0);
        let mut shifted = r.clone();
        shifted.timestamp = r.timestamp.to_offset(time::macros::offset!(+2));
        assert_eq!(reading_digest(&r), reading_digest(&shifted));
    }
}
