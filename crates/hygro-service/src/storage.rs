//! Opening the configured backend and its maintenance sweeps.

use std::sync::Arc;

use tracing::info;

use hygro_store::{
    BackendKind, CompactionSweeper, IndexedStore, PartitionedFileStore, RetentionSweeper,
    StorageBackend,
};

use crate::config::StorageConfig;
use crate::scheduler::Sweep;

/// The open backend, plus the concrete file store when that is the backend in use.
pub struct Storage {
    pub backend: Arc<dyn StorageBackend>,
    file_store: Option<Arc<PartitionedFileStore>>,
}

impl Storage {
    /// Open the backend selected by `config`.
    pub fn open(config: &StorageConfig) -> hygro_store::Result<Self> {
        let path = config.resolved_path();
        info!("Opening {} backend at {}", config.backend, path.display());

        Ok(match config.backend {
            BackendKind::Indexed => Self {
                backend: Arc::new(IndexedStore::open(&path)?),
                file_store: None,
            },
            BackendKind::PartitionedFile => {
                let store = Arc::new(PartitionedFileStore::open(
                    &path,
                    config.file_store_options(),
                )?);
                Self {
                    backend: store.clone(),
                    file_store: Some(store),
                }
            }
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Sweeps to schedule for this backend.
    ///
    /// Retention is skipped when the horizon is zero. Compaction only applies
    /// to the file backend with compression enabled.
    pub fn sweeps(&self, config: &StorageConfig) -> Vec<Arc<dyn Sweep>> {
        let mut sweeps: Vec<Arc<dyn Sweep>> = Vec::new();

        let horizon = config.retention_horizon();
        if horizon.is_zero() {
            info!("Retention disabled (horizon 0)");
        } else {
            sweeps.push(Arc::new(RetentionSweeper::new(self.backend.clone(), horizon)));
        }

        if let Some(store) = &self.file_store {
            if config.compression {
                sweeps.push(Arc::new(CompactionSweeper::new(store.clone())));
            } else {
                info!("Compression disabled, compaction sweep not scheduled");
            }
        }

        sweeps
    }
}
