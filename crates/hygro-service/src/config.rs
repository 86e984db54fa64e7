//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::UtcOffset;
use time::macros::format_description;

use hygro_store::{
    BackendKind, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_READINGS_PER_FILE, FileStoreOptions,
    MigrationOptions,
};

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage settings.
    pub storage: StorageConfig,
    /// One-shot migration settings.
    pub migration: MigrationConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every error found.
    ///
    /// # Example
    ///
    /// ```
    /// use hygro_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.storage.validate());
        errors.extend(self.migration.validate(&self.storage));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Which backend to open.
    pub backend: BackendKind,
    /// Database file or file-store root. Defaults per backend when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Retention horizon in hours; 0 keeps data forever.
    pub retention_hours: u64,
    /// Partition interval in hours (file backend).
    pub partition_interval_hours: u64,
    /// Readings per segment before rolling (file backend).
    pub max_readings_per_file: usize,
    /// Compress cold partitions (file backend).
    pub compression: bool,
    /// Time zone of partition boundaries, as `+HH:MM`.
    pub utc_offset: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: None,
            retention_hours: 0,
            partition_interval_hours: 24,
            max_readings_per_file: DEFAULT_MAX_READINGS_PER_FILE,
            compression: true,
            utc_offset: "+00:00".to_string(),
        }
    }
}

impl StorageConfig {
    /// The configured path, or the platform default for the backend.
    pub fn resolved_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(path), _) => path.clone(),
            (None, BackendKind::Indexed) => hygro_store::default_db_path(),
            (None, BackendKind::PartitionedFile) => hygro_store::default_partition_root(),
        }
    }

    pub fn retention_horizon(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }

    pub fn partition_interval(&self) -> Duration {
        Duration::from_secs(self.partition_interval_hours.saturating_mul(3600))
    }

    pub fn parsed_utc_offset(&self) -> Option<UtcOffset> {
        UtcOffset::parse(
            &self.utc_offset,
            format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
        )
        .ok()
    }

    /// Options for opening a partitioned file store with these settings.
    pub fn file_store_options(&self) -> FileStoreOptions {
        FileStoreOptions {
            partition_interval: self.partition_interval(),
            max_readings_per_file: self.max_readings_per_file,
            utc_offset: self.parsed_utc_offset().unwrap_or(UtcOffset::UTC),
        }
    }

    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(path) = &self.path
            && path.as_os_str().is_empty()
        {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "storage path cannot be empty (omit it to use the default)".to_string(),
            });
        }

        if self.partition_interval_hours == 0 {
            errors.push(ValidationError {
                field: "storage.partition_interval_hours".to_string(),
                message: "partition interval must be at least 1 hour".to_string(),
            });
        }

        if self.max_readings_per_file == 0 {
            errors.push(ValidationError {
                field: "storage.max_readings_per_file".to_string(),
                message: "max readings per file must be greater than 0".to_string(),
            });
        }

        if self.parsed_utc_offset().is_none() {
            errors.push(ValidationError {
                field: "storage.utc_offset".to_string(),
                message: format!(
                    "invalid UTC offset '{}': expected format '+HH:MM'",
                    self.utc_offset
                ),
            });
        }

        errors
    }
}

/// One-shot migration from a partitioned file store into the configured backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Run the migration at startup.
    pub enabled: bool,
    /// Root of the file store to migrate from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Readings per destination write.
    pub chunk_size: usize,
    /// Compare content checksums, not only counts.
    pub verify_checksum: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_checksum: true,
        }
    }
}

impl MigrationConfig {
    pub fn options(&self) -> MigrationOptions {
        MigrationOptions {
            chunk_size: self.chunk_size,
            verify_checksum: self.verify_checksum,
        }
    }

    /// Validate migration configuration against the storage it writes into.
    pub fn validate(&self, storage: &StorageConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.chunk_size == 0 {
            errors.push(ValidationError {
                field: "migration.chunk_size".to_string(),
                message: "chunk size must be greater than 0".to_string(),
            });
        }

        if !self.enabled {
            return errors;
        }

        match &self.source {
            None => errors.push(ValidationError {
                field: "migration.source".to_string(),
                message: "a source file-store root is required when migration is enabled"
                    .to_string(),
            }),
            Some(source) if *source == storage.resolved_path() => errors.push(ValidationError {
                field: "migration.source".to_string(),
                message: format!(
                    "source '{}' is the same as the storage path",
                    source.display()
                ),
            }),
            Some(_) => {}
        }

        if storage.backend != BackendKind::Indexed {
            errors.push(ValidationError {
                field: "storage.backend".to_string(),
                message: format!(
                    "migration writes into the indexed backend, but storage.backend is '{}'",
                    storage.backend
                ),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `storage.utc_offset`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hygro")
        .join("server.toml")
}
