//! Shared types for hygro temperature and humidity readings.
//!
//! This crate provides the record exchanged between the ingestion side
//! (scanners, decoders) and the storage side (hygro-store).
//!
//! # Features
//!
//! - [`Reading`] with derived psychrometric fields
//! - [`DeviceStats`] and a single-pass [`StatsAccumulator`]
//! - [`TimeRange`] with inclusive bounds and RFC3339 parsing
//!
//! # Example
//!
//! ```
//! use hygro_types::{Reading, TimeRange};
//! use time::macros::datetime;
//!
//! let reading = Reading::new("A4:C1:38:00:11:22", datetime!(2024-05-01 12:00 UTC), 21.5, 48.0);
//! let range = TimeRange::parse_rfc3339(Some("2024-05-01T00:00:00Z"), None)?;
//! assert!(range.contains(reading.timestamp));
//! # Ok::<(), hygro_types::ParseError>(())
//! ```

pub mod error;
pub mod range;
pub mod stats;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use range::TimeRange;
pub use stats::{DeviceStats, FieldStats, StatsAccumulator};
pub use types::Reading;
