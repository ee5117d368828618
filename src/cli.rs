// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subcommand handlers. `main` maps each subcommand to one of these and turns
//! the error into an exit code with [`SidecarError::exit_code`].
//!
//! [`SidecarError::exit_code`]: crate::error::SidecarError::exit_code

use crate::bootstrap::{BootstrapController, BootstrapOutcome};
use crate::client::BackupClient;
use crate::config::SidecarConfig;
use crate::configure::ConfigEngine;
use crate::datadir::DataDirectory;
use crate::engine::MySqlEngine;
use crate::error::{Result, SidecarError};
use crate::server::BackupServer;
use crate::storage::StorageLocation;
use crate::tools::Toolset;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `clone-and-init`: populate the data directory, then write the server
/// config fragment.
///
/// Runs before the engine starts, so only the offline part of configuration
/// happens here; accounts and replication are applied by `run`.
pub async fn clone_and_init(config: &SidecarConfig, cancel: CancellationToken) -> Result<()> {
    let data_dir = Arc::new(DataDirectory::new(&config.paths.data_dir));
    let tools = Toolset::xtrabackup(&config.tools, &config.paths.data_dir, &config.engine.admin_url)
        .map_err(SidecarError::into_clone_failure)?;
    let controller = BootstrapController::new(config, data_dir, &tools)
        .map_err(SidecarError::into_clone_failure)?;

    match controller.bootstrap(&cancel).await? {
        BootstrapOutcome::AlreadyInitialized => info!("Data directory already initialised"),
        BootstrapOutcome::NoSourceConfigured => info!("Starting with an empty data directory"),
        BootstrapOutcome::Cloned(report) => info!(
            source = %report.source,
            bytes = report.stats.bytes_in,
            to_lsn = report.to_lsn,
            "Clone finished"
        ),
    }

    ConfigEngine::new(config)?.write_server_conf().await?;
    Ok(())
}

/// `run`: configure the engine, then serve backups until cancelled.
pub async fn run(config: &SidecarConfig, cancel: CancellationToken) -> Result<()> {
    let config_engine = ConfigEngine::new(config)?;
    let engine = Arc::new(MySqlEngine::new(&config.engine.admin_url));
    config_engine.configure(engine.as_ref(), &cancel).await?;

    let tools = Toolset::xtrabackup(&config.tools, &config.paths.data_dir, &config.engine.admin_url)?;
    let server = BackupServer::new(
        config,
        config_engine.identity().clone(),
        tools.producer,
        engine,
        Arc::new(DataDirectory::new(&config.paths.data_dir)),
    );
    server.run(cancel).await
}

/// `take-backup-to <source-host> <destination>`.
pub async fn take_backup_to(
    config: &SidecarConfig,
    source_host: &str,
    destination: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let destination = StorageLocation::parse(destination)?;
    let report = BackupClient::new(config)?
        .take_backup(source_host, &destination, &cancel)
        .await?;
    match &report.manifest {
        Some(manifest) => info!(object = %report.object, manifest = %manifest, "Backup complete"),
        None => warn!(object = %report.object, "Backup complete without manifest"),
    }
    Ok(())
}
