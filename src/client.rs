// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backup Client: pull a snapshot from a peer into object storage.
//!
//! ```text
//! peer GET /xbackup ──► Pump (zstd encode, sha256) ──► multipart upload
//!                                                       │ commit on shutdown
//!                                                       ▼
//!                                              <object>.manifest.json
//! ```
//!
//! The upload is all-or-nothing: a broken source or a refused part aborts the
//! multipart upload, and nothing becomes visible at the destination. The
//! manifest is only written after the artifact is committed; if that write
//! fails the artifact stays and the backup still counts as taken.

use crate::config::SidecarConfig;
use crate::error::{BackupStage, Result, SidecarError};
use crate::metrics;
use crate::peer::PeerClient;
use crate::storage::{self, BackupManifest, StorageLocation};
use crate::stream::{Codec, CopyStats, Pump, PumpError};
use chrono::Utc;
use object_store::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A committed backup.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub source: String,
    pub object: Path,
    /// `None` when the artifact committed but its manifest could not be written.
    pub manifest: Option<Path>,
    pub stats: CopyStats,
    pub duration: Duration,
}

pub struct BackupClient {
    peers: PeerClient,
    cluster: String,
    buf_size: usize,
    compression_level: i32,
    upload_concurrency: usize,
}

impl BackupClient {
    pub fn new(config: &SidecarConfig) -> Result<Self> {
        Ok(Self {
            peers: PeerClient::new(&config.backup, config.clone.peer_request_timeout_duration())?,
            cluster: config.node.cluster_name.clone(),
            buf_size: config.backup.stream_buffer_size,
            compression_level: config.backup.compression_level,
            upload_concurrency: config.backup.upload_concurrency,
        })
    }

    /// Stream a backup from `source_host` into `destination`.
    ///
    /// Errors: `LockConflict` when the source is busy, otherwise
    /// `UploadAborted` with the stage that failed.
    pub async fn take_backup(
        &self,
        source_host: &str,
        destination: &StorageLocation,
        cancel: &CancellationToken,
    ) -> Result<BackupReport> {
        let started = Instant::now();
        let result = self.transfer(source_host, destination, cancel).await;

        let stage = match &result {
            Ok(_) => None,
            Err(SidecarError::UploadAborted { stage, .. }) => Some(stage.to_string()),
            Err(SidecarError::LockConflict { .. }) => Some("lock-conflict".to_string()),
            Err(_) => Some("other".to_string()),
        };
        let bytes = result.as_ref().map(|r| r.stats.bytes_out).unwrap_or(0);
        metrics::record_backup_upload(stage.as_deref(), bytes, started.elapsed());

        match result {
            Ok(mut report) => {
                report.duration = started.elapsed();
                info!(
                    source = %source_host,
                    object = %report.object,
                    raw_bytes = report.stats.bytes_in,
                    stored_bytes = report.stats.bytes_out,
                    duration_ms = report.duration.as_millis() as u64,
                    "Backup uploaded"
                );
                Ok(report)
            }
            Err(e) => {
                error!(source = %source_host, destination = %destination, error = %e, "Backup failed");
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        source_host: &str,
        destination: &StorageLocation,
        cancel: &CancellationToken,
    ) -> Result<BackupReport> {
        let mut stream = match self.peers.open_backup(source_host).await {
            Ok(stream) => stream,
            Err(e @ SidecarError::LockConflict { .. }) => return Err(e),
            Err(e) => {
                return Err(SidecarError::upload_aborted(
                    BackupStage::SourceConnection,
                    e.to_string(),
                ))
            }
        };

        let started_at = stream.started_at.unwrap_or_else(Utc::now);
        let object = destination.upload_target(&self.cluster, started_at);
        info!(source = %source_host, object = %object, "Uploading backup");

        let mut writer =
            storage::upload_writer(destination.store().clone(), object.clone(), self.upload_concurrency);
        let pump = Pump::new(self.buf_size)
            .codec(Codec::ZstdEncode {
                level: self.compression_level,
            })
            .hash_input();

        let failure = match pump.run(&mut stream.reader, &mut writer, cancel).await {
            Ok(stats) if stats.bytes_in == 0 => {
                SidecarError::upload_aborted(BackupStage::MidStream, "source sent an empty stream")
            }
            Ok(stats) => {
                // A failed commit leaves nothing at `object`; the writer
                // cannot be aborted after shutdown.
                writer.shutdown().await.map_err(|e| {
                    SidecarError::upload_aborted(BackupStage::DestinationWrite, format!("commit failed: {e}"))
                })?;
                return self
                    .finish(source_host, destination, object, stream.node, started_at, stats)
                    .await;
            }
            Err(PumpError::Write(e)) => {
                SidecarError::upload_aborted(BackupStage::DestinationWrite, e.to_string())
            }
            Err(e) => SidecarError::upload_aborted(BackupStage::MidStream, e.to_string()),
        };

        if let Err(e) = writer.abort().await {
            warn!(object = %object, error = %e, "Failed to abort multipart upload");
        }
        Err(failure)
    }

    async fn finish(
        &self,
        source_host: &str,
        destination: &StorageLocation,
        object: Path,
        node: Option<String>,
        started_at: chrono::DateTime<Utc>,
        stats: CopyStats,
    ) -> Result<BackupReport> {
        let manifest = BackupManifest {
            node: node.unwrap_or_else(|| source_host.to_string()),
            started_at,
            finished_at: Utc::now(),
            raw_bytes: stats.bytes_in,
            stored_bytes: stats.bytes_out,
            sha256: stats.sha256.clone().unwrap_or_default(),
            compression: "zstd".to_string(),
        };
        let manifest = match storage::write_manifest(destination.store().as_ref(), &object, &manifest).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(
                    object = %object,
                    error = %e,
                    "Backup committed but its manifest was not written; the artifact remains"
                );
                None
            }
        };
        Ok(BackupReport {
            source: source_host.to_string(),
            object,
            manifest,
            stats,
            duration: Duration::ZERO,
        })
    }
}
