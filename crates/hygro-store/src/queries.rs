//! Query builder for the indexed backend.
//!
//! # Example
//!
//! ```
//! use hygro_store::ReadingQuery;
//! use hygro_types::TimeRange;
//! use time::macros::datetime;
//!
//! let query = ReadingQuery::new()
//!     .device("A4:C1:38:00:11:22")
//!     .range(TimeRange::new(Some(datetime!(2024-05-01 00:00 UTC)), None))
//!     .limit(50);
//! assert_eq!(query.limit, Some(50));
//! ```

use rusqlite::types::Value;
use time::OffsetDateTime;

use hygro_types::TimeRange;

/// Columns in the order [`crate::IndexedStore`] decodes them.
pub(crate) const READING_COLUMNS: &str = "device_addr, device_name, timestamp, temperature, \
     temperature_f, humidity, battery, rssi, client_id, dew_point, absolute_humidity, \
     steam_pressure";

/// Unix nanoseconds for a range bound, saturating outside the `i64` range.
pub(crate) fn bound_nanos(t: OffsetDateTime) -> i64 {
    let nanos = t.unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

/// Filters and paging for [`crate::IndexedStore::query_readings`].
///
/// An empty query selects every reading, oldest first.
#[derive(Debug, Default, Clone)]
pub struct ReadingQuery {
    pub device_addr: Option<String>,
    /// Inclusive timestamp bounds.
    pub range: TimeRange,
    pub client_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub newest_first: bool,
}

impl ReadingQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, device_addr: impl Into<String>) -> Self {
        self.device_addr = Some(device_addr.into());
        self
    }

    pub fn range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    /// Only readings received by this collector.
    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    /// Render the statement and its positional parameters.
    ///
    /// Ties on timestamp fall back to insertion order so paging is stable.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut filters: Vec<(&str, Value)> = Vec::new();
        if let Some(addr) = &self.device_addr {
            filters.push(("device_addr = ?", Value::Text(addr.clone())));
        }
        if let Some(from) = self.range.from {
            filters.push(("timestamp >= ?", Value::Integer(bound_nanos(from))));
        }
        if let Some(to) = self.range.to {
            filters.push(("timestamp <= ?", Value::Integer(bound_nanos(to))));
        }
        if let Some(client) = &self.client_id {
            filters.push(("client_id = ?", Value::Text(client.clone())));
        }

        let mut sql = format!("SELECT {READING_COLUMNS} FROM readings");
        let (clauses, params): (Vec<&str>, Vec<Value>) = filters.into_iter().unzip();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let direction = if self.newest_first { "DESC" } else { "ASC" };
        sql.push_str(&format!(" ORDER BY timestamp {direction}, id {direction}"));

        // OFFSET is only valid after LIMIT; -1 means unbounded.
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        (sql, params)
    }
}
