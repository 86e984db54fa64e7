//! Hygro Service - storage backend host with background maintenance.
//!
//! Run with: `cargo run -p hygro-service`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hygro_service::{Config, DAILY, Storage, run_migration, spawn_periodic};
use hygro_store::BackendKind;

/// Hygro Service - time-partitioned storage for sensor readings.
#[derive(Parser, Debug)]
#[command(name = "hygro-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage backend (overrides config).
    #[arg(short, long, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// Database file or file-store root (overrides config).
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Migrate the file store at this root into the indexed backend, then exit.
    #[arg(long, value_name = "SOURCE")]
    migrate: Option<PathBuf>,
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    match s {
        "indexed" => Ok(BackendKind::Indexed),
        "partitioned-file" => Ok(BackendKind::PartitionedFile),
        other => Err(format!(
            "unknown backend '{other}' (expected 'indexed' or 'partitioned-file')"
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hygro_service=info".parse()?)
                .add_directive("hygro_store=info".parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    if let Some(backend) = args.backend {
        config.storage.backend = backend;
    }
    if let Some(path) = args.path {
        config.storage.path = Some(path);
    }
    let one_shot = args.migrate.is_some();
    if let Some(source) = args.migrate {
        config.migration.enabled = true;
        config.migration.source = Some(source);
    }
    config.validate()?;

    let storage = Arc::new(Storage::open(&config.storage)?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    if config.migration.enabled {
        let dest = Arc::clone(&storage);
        let storage_config = config.storage.clone();
        let migration = config.migration.clone();
        let cancel = cancel.clone();

        let report = tokio::task::spawn_blocking(move || {
            let source = migration
                .source
                .clone()
                .context("migration source is not configured")?;
            run_migration(
                &source,
                &storage_config,
                dest.backend.as_ref(),
                migration.options(),
                cancel,
            )
            .context("migration failed")
        })
        .await??;

        if !report.mismatches.is_empty() {
            warn!(
                "Migration finished with {} mismatched devices",
                report.mismatches.len()
            );
        }
        if one_shot {
            storage.backend.close()?;
            return Ok(());
        }
    }

    let handles: Vec<_> = storage
        .sweeps(&config.storage)
        .into_iter()
        .map(|sweep| spawn_periodic(sweep, DAILY, cancel.clone()))
        .collect();
    info!(
        "Serving {} backend with {} background sweeps",
        storage.kind(),
        handles.len()
    );

    cancel.cancelled().await;
    for handle in handles {
        handle.await?;
    }

    storage.backend.close()?;
    info!("Storage closed");
    Ok(())
}
