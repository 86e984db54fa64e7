//! SQLite-backed indexed store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, Row, params};
use time::OffsetDateTime;
use tracing::{debug, info};

use hygro_types::{DeviceStats, FieldStats, Reading, TimeRange};

use crate::backend::{BackendKind, StorageBackend};
use crate::error::{Error, Result};
use crate::queries::{ReadingQuery, bound_nanos};
use crate::schema;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle read connections kept for reuse.
const MAX_IDLE_READERS: usize = 8;

const INSERT_SQL: &str = "INSERT OR IGNORE INTO readings (device_addr, device_name, timestamp, \
     temperature, temperature_f, humidity, battery, rssi, client_id, dew_point, \
     absolute_humidity, steam_pressure) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

/// Numeric columns summarised by [`IndexedStore::stats`], in `DeviceStats` field order.
const STAT_COLUMNS: [&str; 8] = [
    "temperature",
    "temperature_f",
    "humidity",
    "battery",
    "rssi",
    "dew_point",
    "absolute_humidity",
    "steam_pressure",
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-file SQLite store with secondary indexes.
///
/// Writes go through one writer connection in short transactions. Reads use
/// separate read-only connections so that, with WAL journaling, readers see
/// the last committed snapshot without waiting for an active writer.
/// An in-memory store (for tests) shares its single connection.
pub struct IndexedStore {
    path: Option<PathBuf>,
    writer: Mutex<Option<Connection>>,
    readers: Mutex<Vec<Connection>>,
    closed: AtomicBool,
}

impl IndexedStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        schema::initialize(&mut conn)?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            writer: Mutex::new(Some(conn)),
            readers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        schema::initialize(&mut conn)?;
        Ok(Self {
            path: None,
            writer: Mutex::new(Some(conn)),
            readers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let mut guard = lock(&self.writer);
        let conn = guard.as_mut().ok_or(Error::Closed)?;
        f(conn)
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let Some(path) = &self.path else {
            return self.with_writer(|conn| f(conn));
        };

        let pooled = lock(&self.readers).pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => {
                debug!("Opening read connection to {}", path.display());
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX
                        | OpenFlags::SQLITE_OPEN_URI,
                )?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn
            }
        };

        let result = f(&conn);

        let mut pool = lock(&self.readers);
        if pool.len() < MAX_IDLE_READERS && !self.closed.load(Ordering::Acquire) {
            pool.push(conn);
        }
        result
    }

    /// Query readings with filters.
    pub fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<Reading>> {
        let (sql, params) = query.to_sql();
        debug!("Executing query: {}", sql);

        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let readings = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), reading_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(readings)
        })
    }

    /// Delete one reading by device and timestamp. Returns the rows removed.
    pub fn delete_reading(&self, device_addr: &str, timestamp: OffsetDateTime) -> Result<u64> {
        let nanos = timestamp_nanos(timestamp)?;
        self.with_writer(|conn| {
            let removed = conn.execute(
                "DELETE FROM readings WHERE device_addr = ?1 AND timestamp = ?2",
                params![device_addr, nanos],
            )?;
            Ok(removed as u64)
        })
    }

    /// Total number of rows across all devices.
    pub fn total_count(&self) -> Result<u64> {
        self.with_reader(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }
}

fn timestamp_nanos(t: OffsetDateTime) -> Result<i64> {
    i64::try_from(t.unix_timestamp_nanos())
        .map_err(|_| Error::InvalidTimestamp(format!("{t} is outside the storable range")))
}

fn timestamp_from_column(idx: usize, nanos: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        device_addr: row.get(0)?,
        device_name: row.get(1)?,
        timestamp: timestamp_from_column(2, row.get(2)?)?,
        temp_c: row.get(3)?,
        temp_f: row.get(4)?,
        humidity: row.get(5)?,
        battery: row.get(6)?,
        rssi: row.get(7)?,
        client_id: row.get(8)?,
        dew_point_c: row.get(9)?,
        abs_humidity: row.get(10)?,
        steam_pressure: row.get(11)?,
    })
}

fn insert(conn: &Connection, reading: &Reading) -> Result<usize> {
    let nanos = timestamp_nanos(reading.timestamp)?;
    let mut stmt = conn.prepare_cached(INSERT_SQL)?;
    let inserted = stmt.execute(params![
        reading.device_addr,
        reading.device_name,
        nanos,
        reading.temp_c,
        reading.temp_f,
        reading.humidity,
        reading.battery,
        reading.rssi,
        reading.client_id,
        reading.dew_point_c,
        reading.abs_humidity,
        reading.steam_pressure,
    ])?;
    Ok(inserted)
}

fn stats_sql() -> String {
    let aggregates: Vec<String> = STAT_COLUMNS
        .iter()
        .map(|c| format!("MIN({c}), MAX({c}), AVG({c})"))
        .collect();
    format!(
        "SELECT COUNT(*), MIN(timestamp), MAX(timestamp), {} FROM readings WHERE device_addr = ?",
        aggregates.join(", ")
    )
}

fn field_stats(row: &Row<'_>, first: usize) -> rusqlite::Result<Option<FieldStats>> {
    let min: Option<f64> = row.get(first)?;
    let max: Option<f64> = row.get(first + 1)?;
    let avg: Option<f64> = row.get(first + 2)?;
    Ok(match (min, max, avg) {
        (Some(min), Some(max), Some(avg)) => Some(FieldStats { min, max, avg }),
        _ => None,
    })
}

impl StorageBackend for IndexedStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Indexed
    }

    fn write(&self, reading: &Reading) -> Result<()> {
        self.with_writer(|conn| insert(conn, reading).map(|_| ()))
    }

    fn write_batch(&self, readings: &[Reading]) -> Result<usize> {
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            for reading in readings {
                inserted += insert(&tx, reading)?;
            }
            tx.commit()?;
            debug!("Inserted {} of {} readings", inserted, readings.len());
            Ok(inserted)
        })
    }

    fn query(&self, device_addr: &str, range: TimeRange) -> Result<Vec<Reading>> {
        self.query_readings(&ReadingQuery::new().device(device_addr).range(range))
    }

    fn stats(&self, device_addr: &str) -> Result<DeviceStats> {
        let sql = stats_sql();
        self.with_reader(|conn| {
            let stats = conn.query_row(&sql, [device_addr], |row| {
                let count: i64 = row.get(0)?;
                if count == 0 {
                    return Ok(DeviceStats::empty(device_addr));
                }
                let first: i64 = row.get(1)?;
                let last: i64 = row.get(2)?;
                Ok(DeviceStats {
                    device_addr: device_addr.to_string(),
                    count: count as u64,
                    first_timestamp: Some(timestamp_from_column(1, first)?),
                    last_timestamp: Some(timestamp_from_column(2, last)?),
                    temp_c: field_stats(row, 3)?,
                    temp_f: field_stats(row, 6)?,
                    humidity: field_stats(row, 9)?,
                    battery: field_stats(row, 12)?,
                    rssi: field_stats(row, 15)?,
                    dew_point_c: field_stats(row, 18)?,
                    abs_humidity: field_stats(row, 21)?,
                    steam_pressure: field_stats(row, 24)?,
                })
            })?;
            Ok(stats)
        })
    }

    fn count(&self, device_addr: &str) -> Result<u64> {
        self.with_reader(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE device_addr = ?",
                [device_addr],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    fn devices(&self) -> Result<Vec<String>> {
        self.with_reader(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT device_addr FROM readings ORDER BY device_addr")?;
            let devices = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(devices)
        })
    }

    fn prune_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let cutoff = bound_nanos(cutoff);
        self.with_writer(|conn| {
            let removed = conn.execute("DELETE FROM readings WHERE timestamp < ?", [cutoff])?;
            if removed > 0 {
                info!("Deleted {} expired readings", removed);
            }
            Ok(removed as u64)
        })
    }

    fn purge_device(&self, device_addr: &str) -> Result<u64> {
        self.with_writer(|conn| {
            let removed =
                conn.execute("DELETE FROM readings WHERE device_addr = ?", [device_addr])?;
            info!("Purged {} readings of {}", removed, device_addr);
            Ok(removed as u64)
        })
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        lock(&self.readers).clear();
        if let Some(conn) = lock(&self.writer).take() {
            conn.close().map_err(|(_, e)| Error::Database(e))?;
        }
        info!("Closed indexed store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const ADDR: &str = "A4:C1:38:00:11:22";

    fn reading(minute: i64) -> Reading {
        Reading::new(
            ADDR,
            datetime!(2024-05-01 10:00 UTC) + time::Duration::minutes(minute),
            20.0 + minute as f64,
            40.0,
        )
        .with_name("GVH5075_1122")
        .with_battery(90)
        .with_rssi(-70)
        .with_client("pi-1")
    }

    #[test]
    fn test_open_in_memory() {
        let store = IndexedStore::open_in_memory().unwrap();
        assert!(store.devices().unwrap().is_empty());
    }

    #[test]
    fn test_insert_and_query_round_trip() {
        let store = IndexedStore::open_in_memory().unwrap();
        let r = reading(0);
        store.write(&r).unwrap();

        let readings = store.query(ADDR, TimeRange::ALL).unwrap();
        assert_eq!(readings, vec![r]);
    }

    #[test]
    fn test_nanosecond_timestamps_survive() {
        let store = IndexedStore::open_in_memory().unwrap();
        let t = datetime!(2024-05-01 10:00:00.123456789 UTC);
        store.write(&Reading::new(ADDR, t, 20.0, 40.0)).unwrap();

        let readings = store.query(ADDR, TimeRange::between(t, t)).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].timestamp, t);
    }

    #[test]
    fn test_duplicate_identity_ignored() {
        let store = IndexedStore::open_in_memory().unwrap();
        let batch = vec![reading(0), reading(0), reading(1)];
        assert_eq!(store.write_batch(&batch).unwrap(), 2);
        store.write(&reading(1)).unwrap();
        assert_eq!(store.count(ADDR).unwrap(), 2);
    }

    #[test]
    fn test_query_readings_by_client() {
        let store = IndexedStore::open_in_memory().unwrap();
        store.write(&reading(0)).unwrap();
        store.write(&reading(1).with_client("pi-2")).unwrap();

        let readings = store
            .query_readings(&ReadingQuery::new().client("pi-2"))
            .unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].client_id, "pi-2");
    }

    #[test]
    fn test_query_newest_first_with_limit() {
        let store = IndexedStore::open_in_memory().unwrap();
        store.write_batch(&(0..10).map(reading).collect::<Vec<_>>()).unwrap();

        let latest = store
            .query_readings(&ReadingQuery::new().device(ADDR).newest_first().limit(1))
            .unwrap();
        assert_eq!(latest, vec![reading(9)]);
    }

    #[test]
    fn test_stats() {
        let store = IndexedStore::open_in_memory().unwrap();
        store.write_batch(&(0..3).map(reading).collect::<Vec<_>>()).unwrap();

        let stats = store.stats(ADDR).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.first_timestamp, Some(reading(0).timestamp));
        assert_eq!(stats.last_timestamp, Some(reading(2).timestamp));
        let temp = stats.temp_c.unwrap();
        assert_eq!((temp.min, temp.max, temp.avg), (20.0, 22.0, 21.0));
        assert_eq!(stats.battery.unwrap().avg, 90.0);
        assert_eq!(stats.rssi.unwrap().max, -70.0);
    }

    #[test]
    fn test_stats_unknown_device() {
        let store = IndexedStore::open_in_memory().unwrap();
        let stats = store.stats("nope").unwrap();
        assert_eq!(stats, DeviceStats::empty("nope"));
    }

    #[test]
    fn test_prune_and_purge() {
        let store = IndexedStore::open_in_memory().unwrap();
        store.write_batch(&(0..10).map(reading).collect::<Vec<_>>()).unwrap();
        store.write(&Reading::new("11:22", reading(0).timestamp, 20.0, 40.0)).unwrap();

        assert_eq!(store.prune_before(reading(5).timestamp).unwrap(), 6);
        assert_eq!(store.count(ADDR).unwrap(), 5);
        assert_eq!(store.purge_device(ADDR).unwrap(), 5);
        assert_eq!(store.devices().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_delete_reading() {
        let store = IndexedStore::open_in_memory().unwrap();
        store.write(&reading(0)).unwrap();
        assert_eq!(store.delete_reading(ADDR, reading(0).timestamp).unwrap(), 1);
        assert_eq!(store.delete_reading(ADDR, reading(0).timestamp).unwrap(), 0);
    }

    #[test]
    fn test_file_database_reads_through_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexedStore::open(dir.path().join("nested/readings.db")).unwrap();
        store.write(&reading(0)).unwrap();

        for _ in 0..3 {
            assert_eq!(store.query(ADDR, TimeRange::ALL).unwrap().len(), 1);
        }
        assert!(lock(&store.readers).len() <= 1);
    }

    #[test]
    fn test_closed_store_fails_fast() {
        let store = IndexedStore::open_in_memory().unwrap();
        store.close().unwrap();
        assert!(matches!(store.write(&reading(0)), Err(Error::Closed)));
        assert!(matches!(store.query(ADDR, TimeRange::ALL), Err(Error::Closed)));
        assert!(matches!(store.close(), Err(Error::Closed)));
    }
}
