//! Directory-of-partitions backend.
//!
//! ```text
//! <root>/
//! ├── 2024-05-01/
//! │   ├── .compacted
//! │   ├── readings_A4C138001122.gz
//! │   └── readings_A4C138001122.1.gz
//! └── 2024-05-02/
//!     └── readings_A4C138001122
//! ```
//!
//! Every `(partition, device)` pair owns a cursor behind its own mutex. The
//! cursor is the unit of mutual exclusion: writers, readers of that device's
//! segments, compaction and retention all take it before touching the files,
//! so a segment is never compressed or deleted while a write is appending to
//! it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use time::{OffsetDateTime, UtcOffset};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hygro_types::{Reading, TimeRange};

use crate::backend::{BackendKind, StorageBackend};
use crate::error::{Error, Result};
use crate::partition::{PartitionId, PartitionResolver};
use crate::segment::{self, SegmentName, device_key};

/// Marker written into a partition once all its segments are compressed.
pub const COMPACTED_MARKER: &str = ".compacted";

/// Default maximum number of readings per segment.
pub const DEFAULT_MAX_READINGS_PER_FILE: usize = 10_000;

/// Options for [`PartitionedFileStore`].
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    /// Partition interval; selects daily, weekly or monthly partitions.
    pub partition_interval: Duration,
    /// Segment size before rolling to a new file.
    pub max_readings_per_file: usize,
    /// Time zone of partition boundaries.
    pub utc_offset: UtcOffset,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            partition_interval: Duration::from_secs(24 * 60 * 60),
            max_readings_per_file: DEFAULT_MAX_READINGS_PER_FILE,
            utc_offset: UtcOffset::UTC,
        }
    }
}

/// A partition directory found under the store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub id: PartitionId,
    pub path: PathBuf,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl PartitionEntry {
    /// Whether compaction already finished for this partition.
    pub fn is_compacted(&self) -> bool {
        self.path.join(COMPACTED_MARKER).exists()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    partition: PartitionId,
    device_key: String,
}

/// Write position of one device inside one partition.
#[derive(Debug, Default)]
struct Cursor {
    loaded: bool,
    seq: u32,
    count: usize,
    /// Set once the partition is deleted; holders must look the cursor up again.
    retired: bool,
}

impl Cursor {
    /// Forget the cached position; the next writer rescans the directory.
    fn invalidate(&mut self) {
        *self = Cursor::default();
    }
}

/// Segments of one device in one partition, as decoded under its lock.
#[derive(Debug, Default)]
pub(crate) struct DeviceRead {
    pub readings: Vec<Reading>,
    /// Segments decoded.
    pub segments: usize,
    /// Segments that could not be opened or decompressed.
    pub skipped: usize,
}

/// Partitioned file backend with transparent gzip decompression.
pub struct PartitionedFileStore {
    root: PathBuf,
    resolver: PartitionResolver,
    max_per_file: usize,
    cursors: Mutex<HashMap<CursorKey, Arc<Mutex<Cursor>>>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PartitionedFileStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P, options: FileStoreOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| Error::CreateDirectory {
            path: root.clone(),
            source: e,
        })?;

        let resolver =
            PartitionResolver::new(options.partition_interval).with_offset(options.utc_offset);
        info!(
            "Opening partitioned file store at {} ({:?} partitions)",
            root.display(),
            resolver.granularity()
        );

        Ok(Self {
            root,
            resolver,
            max_per_file: options.max_readings_per_file.max(1),
            cursors: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolver(&self) -> &PartitionResolver {
        &self.resolver
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Run `f` holding the cursor lock of one `(partition, device)` pair.
    ///
    /// Afterwards the entry is dropped again unless a writer loaded it or
    /// another caller still holds it, so the map only keeps cursors of
    /// devices being written.
    fn with_cursor<T>(
        &self,
        partition: PartitionId,
        device_key: &str,
        f: impl FnOnce(&mut Cursor) -> Result<T>,
    ) -> Result<T> {
        let key = CursorKey {
            partition,
            device_key: device_key.to_string(),
        };

        let (cursor_lock, result) = loop {
            let cursor_lock = Arc::clone(lock(&self.cursors).entry(key.clone()).or_default());
            let mut cursor = lock(&cursor_lock);
            if cursor.retired {
                continue;
            }
            let result = f(&mut *cursor);
            drop(cursor);
            break (cursor_lock, result);
        };

        let mut cursors = lock(&self.cursors);
        let unshared = Arc::strong_count(&cursor_lock) == 2
            && cursors.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cursor_lock));
        if unshared && !lock(&cursor_lock).loaded {
            cursors.remove(&key);
        }
        result
    }

    #[cfg(test)]
    fn cursor_count(&self) -> usize {
        lock(&self.cursors).len()
    }

    fn partition_dir(&self, id: &PartitionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Every partition under the root, oldest first.
    ///
    /// Directories whose names are not partition identifiers are ignored.
    pub fn partitions(&self) -> Result<Vec<PartitionEntry>> {
        self.ensure_open()?;
        let mut partitions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| PartitionId::parse(n).ok()) else {
                debug!("Ignoring non-partition directory {:?}", name);
                continue;
            };
            let (start, end) = self.resolver.range(&id);
            partitions.push(PartitionEntry {
                id,
                path: entry.path(),
                start,
                end,
            });
        }
        partitions.sort_by_key(|p| p.id);
        Ok(partitions)
    }

    /// The partition receiving writes at `now`.
    pub fn current_partition(&self, now: OffsetDateTime) -> PartitionId {
        self.resolver.resolve(now)
    }

    /// Segment files of one partition.
    pub fn segments(&self, partition: &PartitionEntry) -> Result<Vec<SegmentName>> {
        self.ensure_open()?;
        segment::list(&partition.path)
    }

    /// Position the cursor after the newest segment on disk.
    fn load_cursor(&self, dir: &Path, key: &str, cursor: &mut Cursor) -> Result<()> {
        let latest = if dir.exists() {
            segment::list(dir)?
                .into_iter()
                .filter(|s| s.device_key == key)
                .max_by_key(|s| (s.seq, s.compressed))
        } else {
            None
        };

        *cursor = match latest {
            None => Cursor {
                loaded: true,
                ..Cursor::default()
            },
            // A compressed segment is sealed; continue in a fresh one.
            Some(s) if s.compressed => Cursor {
                loaded: true,
                seq: s.seq + 1,
                ..Cursor::default()
            },
            Some(s) => Cursor {
                loaded: true,
                seq: s.seq,
                count: segment::seal_lines(&dir.join(s.file_name()))?,
                ..Cursor::default()
            },
        };
        Ok(())
    }

    /// Append readings that all resolve to `partition` and share `key`.
    fn append_group(&self, partition: PartitionId, key: &str, readings: &[&Reading]) -> Result<()> {
        let dir = self.partition_dir(&partition);
        self.with_cursor(partition, key, |cursor| {
            let result = self.append_locked(&dir, key, cursor, readings);
            if result.is_err() {
                // Position unknown after a failed append.
                cursor.invalidate();
            }
            result
        })
    }

    fn append_locked(
        &self,
        dir: &Path,
        key: &str,
        cursor: &mut Cursor,
        readings: &[&Reading],
    ) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| Error::CreateDirectory {
            path: dir.to_path_buf(),
            source: e,
        })?;
        if !cursor.loaded {
            self.load_cursor(dir, key, cursor)?;
        }

        let mut opened_segment = false;
        let mut remaining = readings;
        while !remaining.is_empty() {
            if cursor.count >= self.max_per_file {
                debug!("Rolling {}/{} to segment {}", dir.display(), key, cursor.seq + 1);
                cursor.seq += 1;
                cursor.count = 0;
            }
            opened_segment |= cursor.count == 0;

            let room = self.max_per_file - cursor.count;
            let (batch, rest) = remaining.split_at(room.min(remaining.len()));
            let path = dir.join(SegmentName::new(key, cursor.seq).file_name());
            segment::append(&path, batch.iter().copied())?;
            cursor.count += batch.len();
            remaining = rest;
        }

        // The marker goes only after the new segment exists on disk.
        if opened_segment {
            remove_marker(dir)?;
        }
        Ok(())
    }

    /// Range query that checks `cancel` between partitions.
    pub fn query_cancellable(
        &self,
        device_addr: &str,
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<Reading>> {
        self.ensure_open()?;
        let key = device_key(device_addr);
        let mut readings = Vec::new();

        for partition in self.partitions()? {
            if !range.overlaps(partition.start, partition.end) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            readings.extend(
                self.read_device(&partition, &key)?
                    .readings
                    .into_iter()
                    .filter(|r| r.device_addr == device_addr && range.contains(r.timestamp)),
            );
        }

        Ok(sort_and_dedup(readings))
    }

    /// Decode every segment of one device in one partition.
    ///
    /// Unreadable segments are logged, counted and skipped.
    pub(crate) fn read_device(&self, partition: &PartitionEntry, key: &str) -> Result<DeviceRead> {
        self.with_cursor(partition.id, key, |_| {
            let segments = match segment::list(&partition.path) {
                Ok(segments) => segments,
                // Removed by retention since the directory listing.
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(DeviceRead::default());
                }
                Err(e) => return Err(e),
            };

            let mut read = DeviceRead::default();
            for name in segments.iter().filter(|s| s.device_key == key) {
                let path = partition.path.join(name.file_name());
                match segment::read(&path, name.compressed) {
                    Ok(decoded) => {
                        read.readings.extend(decoded.readings);
                        read.segments += 1;
                    }
                    Err(e) => {
                        warn!("Skipping unreadable segment {}: {}", path.display(), e);
                        read.skipped += 1;
                    }
                }
            }
            Ok(read)
        })
    }

    /// Compress every uncompressed segment of a partition and mark it compacted.
    ///
    /// Each device's segments are compressed while holding that device's
    /// cursor lock. Returns the number of segments compressed; a partition
    /// that is already marked is skipped.
    pub fn compact_partition(&self, partition: &PartitionEntry) -> Result<usize> {
        self.ensure_open()?;
        if partition.is_compacted() {
            return Ok(0);
        }

        let keys: BTreeSet<String> = segment::list(&partition.path)?
            .into_iter()
            .filter(|s| !s.compressed)
            .map(|s| s.device_key)
            .collect();

        let mut compressed = 0;
        for key in keys {
            compressed += self.with_cursor(partition.id, &key, |cursor| {
                let mut done = 0;
                for name in segment::list(&partition.path)?
                    .into_iter()
                    .filter(|s| s.device_key == key && !s.compressed)
                {
                    let path = partition.path.join(name.file_name());
                    segment::compress(&path)?;
                    debug!("Compressed {}", path.display());
                    done += 1;
                }
                cursor.invalidate();
                Ok(done)
            })?;
        }

        fs::write(partition.path.join(COMPACTED_MARKER), b"")?;
        // A writer may have opened a segment after its device was compressed.
        if segment::list(&partition.path)?.iter().any(|s| !s.compressed) {
            remove_marker(&partition.path)?;
        }
        Ok(compressed)
    }

    /// Delete a partition directory with everything in it.
    pub fn delete_partition(&self, partition: &PartitionEntry) -> Result<()> {
        self.ensure_open()?;

        // The map stays locked until the directory is gone, so no writer
        // can open a fresh cursor into it meanwhile.
        let mut cursors = lock(&self.cursors);
        let locks: Vec<Arc<Mutex<Cursor>>> = cursors
            .iter()
            .filter(|(key, _)| key.partition == partition.id)
            .map(|(_, cursor)| Arc::clone(cursor))
            .collect();
        let mut guards: Vec<_> = locks.iter().map(|l| lock(l)).collect();

        let removed: Result<()> = match fs::remove_dir_all(&partition.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        for guard in &mut guards {
            guard.invalidate();
            guard.retired = true;
        }
        cursors.retain(|key, _| key.partition != partition.id);
        removed
    }

    /// Remove one device's readings from a partition, rewriting shared segments.
    fn purge_from_partition(&self, partition: &PartitionEntry, device_addr: &str) -> Result<u64> {
        let key = device_key(device_addr);
        self.with_cursor(partition.id, &key, |cursor| {
            let mut removed = 0;
            for name in segment::list(&partition.path)?
                .into_iter()
                .filter(|s| s.device_key == key)
            {
                let path = partition.path.join(name.file_name());
                let decoded = segment::read(&path, name.compressed)?;
                let before = decoded.readings.len();
                let kept: Vec<Reading> = decoded
                    .readings
                    .into_iter()
                    .filter(|r| r.device_addr != device_addr)
                    .collect();
                removed += (before - kept.len()) as u64;

                if kept.is_empty() {
                    fs::remove_file(&path)?;
                } else if kept.len() != before {
                    segment::rewrite(&path, name.compressed, &kept)?;
                }
            }
            cursor.invalidate();
            Ok(removed)
        })
    }
}

fn remove_marker(dir: &Path) -> Result<()> {
    match fs::remove_file(dir.join(COMPACTED_MARKER)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// File key for a written reading; the empty address has none.
fn write_key(device_addr: &str) -> Result<String> {
    let key = device_key(device_addr);
    if key.is_empty() {
        return Err(Error::InvalidDeviceAddress(device_addr.to_string()));
    }
    Ok(key)
}

/// Sort by timestamp and drop repeated identities.
///
/// The sort is stable, so readings with equal timestamps keep write order.
pub(crate) fn sort_and_dedup(mut readings: Vec<Reading>) -> Vec<Reading> {
    readings.sort_by_key(|r| r.timestamp);
    let mut seen = HashSet::with_capacity(readings.len());
    readings.retain(|r| seen.insert((r.timestamp, r.client_id.clone())));
    readings
}

impl StorageBackend for PartitionedFileStore {
    fn kind(&self) -> BackendKind {
        BackendKind::PartitionedFile
    }

    fn write(&self, reading: &Reading) -> Result<()> {
        self.ensure_open()?;
        let key = write_key(&reading.device_addr)?;
        let partition = self.resolver.resolve(reading.timestamp);
        self.append_group(partition, &key, &[reading])
    }

    fn write_batch(&self, readings: &[Reading]) -> Result<usize> {
        self.ensure_open()?;
        let mut groups: Vec<((PartitionId, String), Vec<&Reading>)> = Vec::new();
        let mut index: HashMap<(PartitionId, String), usize> = HashMap::new();
        for reading in readings {
            let key = (
                self.resolver.resolve(reading.timestamp),
                write_key(&reading.device_addr)?,
            );
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                groups.push((key, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(reading);
        }

        for ((partition, key), group) in &groups {
            self.append_group(*partition, key, group)?;
        }
        Ok(readings.len())
    }

    fn query(&self, device_addr: &str, range: TimeRange) -> Result<Vec<Reading>> {
        self.query_cancellable(device_addr, range, &CancellationToken::new())
    }

    fn devices(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut devices = BTreeSet::new();
        for partition in self.partitions()? {
            let keys: BTreeSet<String> = segment::list(&partition.path)?
                .into_iter()
                .map(|s| s.device_key)
                .collect();
            for key in keys {
                devices.extend(
                    self.read_device(&partition, &key)?
                        .readings
                        .into_iter()
                        .map(|r| r.device_addr),
                );
            }
        }
        Ok(devices.into_iter().collect())
    }

    fn prune_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        self.ensure_open()?;
        let mut removed = 0;
        for partition in self.partitions()? {
            if partition.end > cutoff {
                continue;
            }
            match self.delete_partition(&partition) {
                Ok(()) => {
                    info!("Deleted expired partition {}", partition.id);
                    removed += 1;
                }
                Err(e) => warn!("Failed to delete partition {}: {}", partition.id, e),
            }
        }
        Ok(removed)
    }

    fn purge_device(&self, device_addr: &str) -> Result<u64> {
        self.ensure_open()?;
        let mut removed = 0;
        for partition in self.partitions()? {
            removed += self.purge_from_partition(&partition, device_addr)?;
        }
        info!("Purged {} readings of {}", removed, device_addr);
        Ok(removed)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        lock(&self.cursors).clear();
        info!("Closed partitioned file store at {}", self.root.display());
        Ok(())
    }
}
