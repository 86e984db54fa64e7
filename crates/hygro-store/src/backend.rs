//! The capability interface every storage backend implements.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use hygro_types::{DeviceStats, Reading, StatsAccumulator, TimeRange};

use crate::error::Result;

/// Which backend implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Single SQLite file with secondary indexes.
    #[default]
    Indexed,
    /// Directory of time partitions holding per-device append files.
    PartitionedFile,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Indexed => write!(f, "indexed"),
            BackendKind::PartitionedFile => write!(f, "partitioned-file"),
        }
    }
}

/// Storage contract consumed by ingestion and query collaborators.
///
/// Implementations must be safe to share across threads: `write` may be
/// called concurrently for the same or different devices. Every method
/// returns [`Error::Closed`](crate::Error::Closed) once [`close`](Self::close)
/// has been called.
pub trait StorageBackend: Send + Sync {
    /// The implementation behind this trait object.
    fn kind(&self) -> BackendKind;

    /// Persist one reading.
    ///
    /// Never rejects a valid reading for capacity reasons.
    fn write(&self, reading: &Reading) -> Result<()>;

    /// Persist several readings, returning how many were newly stored.
    ///
    /// Backends that deduplicate by [`Reading::identity`] may return less
    /// than `readings.len()`.
    fn write_batch(&self, readings: &[Reading]) -> Result<usize> {
        for reading in readings {
            self.write(reading)?;
        }
        Ok(readings.len())
    }

    /// Readings of one device within `range` (inclusive), sorted ascending by
    /// timestamp and deduplicated. Unknown devices yield an empty vector.
    fn query(&self, device_addr: &str, range: TimeRange) -> Result<Vec<Reading>>;

    /// Aggregate statistics over all readings of a device.
    ///
    /// Returns zero-count stats, not an error, for a device without data.
    fn stats(&self, device_addr: &str) -> Result<DeviceStats> {
        let mut acc = StatsAccumulator::new(device_addr);
        for reading in self.query(device_addr, TimeRange::ALL)? {
            acc.push(&reading);
        }
        Ok(acc.finish())
    }

    /// Number of stored readings for a device.
    fn count(&self, device_addr: &str) -> Result<u64> {
        Ok(self.query(device_addr, TimeRange::ALL)?.len() as u64)
    }

    /// Every device address with at least one stored reading, sorted.
    fn devices(&self) -> Result<Vec<String>>;

    /// Remove data that lies entirely before `cutoff`.
    ///
    /// Returns the number of units removed: partitions for partitioned
    /// backends, rows for the indexed backend.
    fn prune_before(&self, cutoff: OffsetDateTime) -> Result<u64>;

    /// Administrative purge of every reading of one device.
    fn purge_device(&self, device_addr: &str) -> Result<u64>;

    /// Release resources. A second call returns `Error::Closed`.
    fn close(&self) -> Result<()>;
}
