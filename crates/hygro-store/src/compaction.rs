//! Compaction sweep: gzips every partition older than the current one.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::file_store::PartitionedFileStore;

/// Result of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Partitions newly marked compacted or with segments compressed.
    pub partitions: usize,
    /// Segments compressed.
    pub segments: usize,
}

/// Periodic compression of cold partitions of a [`PartitionedFileStore`].
///
/// The partition receiving writes at `now` is never touched.
pub struct CompactionSweeper {
    store: Arc<PartitionedFileStore>,
}

impl CompactionSweeper {
    pub fn new(store: Arc<PartitionedFileStore>) -> Self {
        Self { store }
    }

    /// Run one pass as of `now`.
    ///
    /// A failure on one partition is logged and the pass moves on to the
    /// next; the partition is retried on the following pass.
    pub fn run_once(&self, now: OffsetDateTime) -> Result<CompactionOutcome> {
        let resolver = self.store.resolver();
        let (current_start, _) = resolver.range(&resolver.resolve(now));

        let mut outcome = CompactionOutcome::default();
        for partition in self.store.partitions()? {
            if partition.end > current_start {
                debug!("Skipping hot partition {}", partition.id);
                continue;
            }
            if partition.is_compacted() {
                continue;
            }
            match self.store.compact_partition(&partition) {
                Ok(segments) => {
                    debug!("Compacted partition {} ({} segments)", partition.id, segments);
                    outcome.partitions += 1;
                    outcome.segments += segments;
                }
                Err(e) => error!("Failed to compact partition {}: {}", partition.id, e),
            }
        }

        if outcome.partitions > 0 {
            info!(
                "Compaction sweep compressed {} segments in {} partitions",
                outcome.segments, outcome.partitions
            );
        }
        Ok(outcome)
    }
}
