//! Database schema for the indexed backend.
//!
//! Each entry of [`MIGRATIONS`] moves the database one version forward.
//! The applied version lives in the single-row `schema_version` table.

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// DDL steps, index `n` upgrades version `n` to `n + 1`.
///
/// `timestamp` holds Unix nanoseconds. The unique identity index makes
/// repeated inserts of the same reading a no-op.
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_addr TEXT NOT NULL,
        device_name TEXT NOT NULL DEFAULT '',
        timestamp INTEGER NOT NULL,
        temperature REAL NOT NULL,
        temperature_f REAL NOT NULL,
        humidity REAL NOT NULL,
        battery INTEGER NOT NULL,
        rssi INTEGER NOT NULL,
        client_id TEXT NOT NULL DEFAULT '',
        dew_point REAL NOT NULL,
        absolute_humidity REAL NOT NULL,
        steam_pressure REAL NOT NULL
    );
    CREATE INDEX idx_readings_device ON readings(device_addr);
    CREATE INDEX idx_readings_timestamp ON readings(timestamp);
    CREATE INDEX idx_readings_device_time ON readings(device_addr, timestamp);
    CREATE INDEX idx_readings_client ON readings(client_id);
    CREATE UNIQUE INDEX idx_readings_identity
        ON readings(device_addr, timestamp, client_id);
"#];

/// Version a fully migrated database reports.
pub const SCHEMA_VERSION: usize = MIGRATIONS.len();

/// Bring the database up to [`SCHEMA_VERSION`].
///
/// Pending steps run in one transaction together with the version bump.
pub fn initialize(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
             id INTEGER PRIMARY KEY CHECK (id = 1),
             version INTEGER NOT NULL
         )",
    )?;

    let current = applied_version(conn)?;
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in &MIGRATIONS[current..] {
        tx.execute_batch(step)?;
    }
    tx.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
        [SCHEMA_VERSION as i64],
    )?;
    tx.commit()?;
    Ok(())
}

fn applied_version(conn: &Connection) -> Result<usize> {
    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.map_or(0, |v| usize::try_from(v).unwrap_or(0)))
}
