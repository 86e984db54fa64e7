//! Storage service for hygro sensor readings.
//!
//! This crate provides a service that:
//! - Opens the configured storage backend (indexed or partitioned-file)
//! - Runs daily retention and compaction sweeps in the background
//! - Optionally migrates a legacy partitioned file store into the indexed backend
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/hygro/server.toml`:
//!
//! ```toml
//! [storage]
//! backend = "partitioned-file"
//! path = "/var/lib/hygro/partitions"
//! retention_hours = 2160          # 90 days, 0 keeps everything
//! partition_interval_hours = 24   # daily partitions
//! max_readings_per_file = 10000
//! compression = true
//! utc_offset = "+00:00"
//!
//! [migration]
//! enabled = false
//! source = "/var/lib/hygro/old-partitions"
//! chunk_size = 1000
//! verify_checksum = true
//! ```

pub mod config;
pub mod migrate;
pub mod scheduler;
pub mod storage;

pub use config::{Config, ConfigError, MigrationConfig, StorageConfig, ValidationError};
pub use migrate::run_migration;
pub use scheduler::{DAILY, Sweep, spawn_periodic};
pub use storage::Storage;
