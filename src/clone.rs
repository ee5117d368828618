// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Clone Manager: populate the local data directory from a snapshot.
//!
//! ```text
//! source (peer HTTP / bucket object)
//!     │  fixed-size chunks, zstd decoded if needed
//!     ▼
//! SnapshotExtractor ──► <live>/.clone-staging/
//!                               │ prepare, verify
//!                               ▼
//!                 entries renamed into <live>, system schema last
//! ```
//!
//! Bytes never reach the live data before promotion. On any failure the
//! staging directory is removed and the live path is left exactly as found.

use crate::datadir::{self, DataDirectory, Staging};
use crate::error::{Result, SidecarError};
use crate::metrics;
use crate::peer::PeerClient;
use crate::storage::{self, StorageLocation};
use crate::stream::{Codec, CopyStats, Pump, PumpError};
use crate::tools::{SnapshotExtractor, SnapshotPreparer};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Where a clone reads its snapshot from. Sources are never modified.
#[derive(Debug, Clone)]
pub enum BackupSource {
    /// A running peer's Backup Server (`host` or `host:port`).
    Peer { host: String },
    /// A snapshot object, or a directory holding several.
    Bucket { location: StorageLocation },
}

impl BackupSource {
    pub fn kind(&self) -> &'static str {
        match self {
            BackupSource::Peer { .. } => "peer",
            BackupSource::Bucket { .. } => "bucket",
        }
    }
}

impl fmt::Display for BackupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupSource::Peer { host } => write!(f, "peer {host}"),
            BackupSource::Bucket { location } => write!(f, "bucket {location}"),
        }
    }
}

/// Outcome of a successful clone.
#[derive(Debug, Clone)]
pub struct CloneReport {
    pub source: String,
    /// Producing node or bucket object, when known.
    pub artifact: Option<String>,
    pub stats: CopyStats,
    pub to_lsn: u64,
    pub duration: Duration,
}

pub struct CloneManager {
    data_dir: Arc<DataDirectory>,
    extractor: Arc<dyn SnapshotExtractor>,
    preparer: Arc<dyn SnapshotPreparer>,
    peers: PeerClient,
    buf_size: usize,
    prepare: bool,
    resume_attempts: u32,
}

impl CloneManager {
    pub fn new(
        data_dir: Arc<DataDirectory>,
        extractor: Arc<dyn SnapshotExtractor>,
        preparer: Arc<dyn SnapshotPreparer>,
        peers: PeerClient,
    ) -> Self {
        Self {
            data_dir,
            extractor,
            preparer,
            peers,
            buf_size: 64 * 1024,
            prepare: true,
            resume_attempts: 3,
        }
    }

    pub fn with_buffer_size(mut self, buf_size: usize) -> Self {
        self.buf_size = buf_size;
        self
    }

    /// Whether to run the preparer before verification.
    pub fn with_prepare(mut self, prepare: bool) -> Self {
        self.prepare = prepare;
        self
    }

    pub fn with_resume_attempts(mut self, attempts: u32) -> Self {
        self.resume_attempts = attempts;
        self
    }

    /// Stream `source` into staging, verify, and promote.
    ///
    /// Errors: `SourceUnavailable`, `StreamInterrupted`, `VerificationFailed`
    /// (and `ConfigInvalid`/`InvalidState` if the live path holds other data
    /// or cannot be written).
    pub async fn clone(&self, source: &BackupSource, cancel: &CancellationToken) -> Result<CloneReport> {
        let started = Instant::now();
        info!(source = %source, live = %self.data_dir.live_path().display(), "Starting clone");

        let staging = self.data_dir.begin_staging().await?;
        let result = self.clone_into(source, staging, cancel).await;

        let bytes = result.as_ref().map(|r| r.stats.bytes_in).unwrap_or(0);
        metrics::record_clone(source.kind(), result.is_ok(), bytes, started.elapsed());
        match result {
            Ok(mut report) => {
                report.duration = started.elapsed();
                info!(
                    source = %source,
                    bytes = report.stats.bytes_in,
                    to_lsn = report.to_lsn,
                    duration_ms = report.duration.as_millis() as u64,
                    "Clone complete"
                );
                Ok(report)
            }
            Err(e) => {
                error!(source = %source, error = %e, "Clone failed");
                self.data_dir.mark_failed();
                Err(e)
            }
        }
    }

    async fn clone_into(
        &self,
        source: &BackupSource,
        staging: Staging,
        cancel: &CancellationToken,
    ) -> Result<CloneReport> {
        let fetched = self.fetch(source, staging.path(), cancel).await;
        let (stats, artifact) = match fetched {
            Ok(v) => v,
            Err(e) => {
                self.data_dir.discard(staging).await;
                return Err(e);
            }
        };

        let checked = self.check(staging.path()).await;
        let to_lsn = match checked {
            Ok(to_lsn) => to_lsn,
            Err(e) => {
                self.data_dir.discard(staging).await;
                return Err(e);
            }
        };

        if let Err(e) = self.data_dir.promote(&staging).await {
            self.data_dir.discard(staging).await;
            return Err(e);
        }

        Ok(CloneReport {
            source: source.to_string(),
            artifact,
            stats,
            to_lsn,
            duration: Duration::ZERO,
        })
    }

    async fn open(&self, source: &BackupSource) -> Result<(Box<dyn AsyncRead + Send + Unpin>, Option<String>)> {
        match source {
            BackupSource::Peer { host } => match self.peers.open_backup(host).await {
                Ok(stream) => Ok((stream.reader, stream.node)),
                Err(SidecarError::LockConflict { node }) => Err(SidecarError::source_unavailable(
                    format!("peer {node}"),
                    "peer is busy producing another backup",
                )),
                Err(e) => Err(e),
            },
            BackupSource::Bucket { location } => {
                let object = location.resolve_latest().await?;
                info!(object = %object, "Downloading snapshot from bucket");
                let reader = storage::download(location.store().clone(), object.clone(), self.resume_attempts);
                Ok((Box::new(reader), Some(object.to_string())))
            }
        }
    }

    async fn fetch(
        &self,
        source: &BackupSource,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<(CopyStats, Option<String>)> {
        let (mut reader, artifact) = self.open(source).await?;
        let mut sink = self.extractor.extract(staging).await?;

        let pump = Pump::new(self.buf_size).codec(Codec::Detect);
        let stats = pump
            .run(&mut reader, &mut sink.writer, cancel)
            .await
            .map_err(|e| match e {
                PumpError::Read(e) => SidecarError::StreamInterrupted(format!("reading {source}: {e}")),
                PumpError::Decode(e) => SidecarError::StreamInterrupted(format!("decoding {source}: {e}")),
                PumpError::Write(e) => SidecarError::StreamInterrupted(format!("extractor: {e}")),
                PumpError::Cancelled => SidecarError::StreamInterrupted("cancelled".into()),
            })?;

        if stats.bytes_in == 0 {
            return Err(SidecarError::StreamInterrupted(format!("{source} sent an empty stream")));
        }

        sink.writer
            .shutdown()
            .await
            .map_err(|e| SidecarError::StreamInterrupted(format!("closing extractor: {e}")))?;
        sink.completion.await?;
        Ok((stats, artifact))
    }

    async fn check(&self, staging: &Path) -> Result<u64> {
        if self.prepare {
            self.preparer.prepare(staging).await?;
        }
        let checkpoints = datadir::verify_snapshot(staging, self.prepare).await?;
        Ok(checkpoints.to_lsn)
    }
}
