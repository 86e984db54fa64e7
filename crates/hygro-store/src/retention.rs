//! Retention sweep: deletes data older than a configured horizon.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::backend::StorageBackend;
use crate::error::Result;

/// Result of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    /// Units removed by the backend: partitions or rows.
    pub removed: u64,
}

/// Periodic pruning of expired data on any backend.
///
/// A horizon of zero disables the sweep entirely.
pub struct RetentionSweeper {
    backend: Arc<dyn StorageBackend>,
    horizon: Duration,
}

impl RetentionSweeper {
    pub fn new(backend: Arc<dyn StorageBackend>, horizon: Duration) -> Self {
        Self { backend, horizon }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Everything strictly older than this instant is expired at `now`.
    ///
    /// `None` when the sweep is disabled or the horizon reaches past the
    /// earliest representable time.
    pub fn cutoff(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        if self.horizon.is_zero() {
            return None;
        }
        let horizon = time::Duration::try_from(self.horizon).ok()?;
        now.checked_sub(horizon)
    }

    /// Run one pass as of `now`.
    ///
    /// Per-partition failures are logged by the backend and retried on the
    /// next pass.
    pub fn run_once(&self, now: OffsetDateTime) -> Result<RetentionOutcome> {
        let Some(cutoff) = self.cutoff(now) else {
            debug!("Retention disabled, skipping sweep");
            return Ok(RetentionOutcome::default());
        };

        let removed = self.backend.prune_before(cutoff)?;
        info!(
            "Retention sweep on {} backend removed {} (cutoff {})",
            self.backend.kind(),
            removed,
            cutoff
        );
        Ok(RetentionOutcome { removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::{FileStoreOptions, PartitionedFileStore};
    use crate::indexed::IndexedStore;
    use hygro_types::{Reading, TimeRange};
    use time::macros::datetime;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_zero_horizon_disables_sweep() {
        let store = Arc::new(IndexedStore::open_in_memory().unwrap());
        store
            .write(&Reading::new("AA", datetime!(2000-01-01 00:00 UTC), 20.0, 40.0))
            .unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), Duration::ZERO);
        assert_eq!(sweeper.cutoff(datetime!(2024-01-01 00:00 UTC)), None);
        let outcome = sweeper.run_once(datetime!(2024-01-01 00:00 UTC)).unwrap();
        assert_eq!(outcome.removed, 0);
        assert_eq!(store.count("AA").unwrap(), 1);
    }

    #[test]
    fn test_cutoff() {
        let store = Arc::new(IndexedStore::open_in_memory().unwrap());
        let sweeper = RetentionSweeper::new(store, 2 * DAY);
        assert_eq!(
            sweeper.cutoff(datetime!(2024-05-10 12:00 UTC)),
            Some(datetime!(2024-05-08 12:00 UTC))
        );
    }

    #[test]
    fn test_indexed_rows_pruned() {
        let store = Arc::new(IndexedStore::open_in_memory().unwrap());
        for day in 1..=5 {
            let t = datetime!(2024-05-01 12:00 UTC) + time::Duration::days(day - 1);
            store.write(&Reading::new("AA", t, 20.0, 40.0)).unwrap();
        }

        let sweeper = RetentionSweeper::new(store.clone(), 2 * DAY);
        let outcome = sweeper.run_once(datetime!(2024-05-05 13:00 UTC)).unwrap();
        assert_eq!(outcome.removed, 3);
        assert_eq!(store.count("AA").unwrap(), 2);
    }

    #[test]
    fn test_partition_kept_until_its_end_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PartitionedFileStore::open(dir.path(), FileStoreOptions::default()).unwrap());
        store
            .write(&Reading::new("AA", datetime!(2024-05-01 23:00 UTC), 20.0, 40.0))
            .unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), DAY);
        // Partition 2024-05-01 ends at 05-02 00:00; cutoff 05-01 23:59 keeps it.
        assert_eq!(sweeper.run_once(datetime!(2024-05-02 23:59 UTC)).unwrap().removed, 0);
        assert_eq!(sweeper.run_once(datetime!(2024-05-03 00:00 UTC)).unwrap().removed, 1);
        assert!(store.query("AA", TimeRange::ALL).unwrap().is_empty());
    }
}
