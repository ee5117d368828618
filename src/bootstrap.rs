// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bootstrap Controller: decide whether to clone, and from where.
//!
//! ```text
//! data ready? ──yes──► AlreadyInitialized
//!     │ no
//!     ▼
//! probe peers ordinal-1 … 0 (within discovery_timeout)
//!     │ first acceptable donor ──────────► clone from peer
//!     │ none
//!     ▼
//! init bucket configured? ──yes──► clone from bucket
//!     │ no
//!     ▼
//! no peers either? ──yes──► NoSourceConfigured (engine initialises itself)
//!     │ no
//!     ▼
//! SourceUnavailable
//! ```
//!
//! Every failure here is a clone failure (exit code 8). Nothing is retried in
//! process; the orchestrator restarts the pod.

use crate::clone::{BackupSource, CloneManager, CloneReport};
use crate::config::SidecarConfig;
use crate::datadir::DataDirectory;
use crate::error::{Result, SidecarError};
use crate::metrics;
use crate::peer::PeerClient;
use crate::resilience::RetryConfig;
use crate::storage::StorageLocation;
use crate::tools::Toolset;
use crate::topology::NodeIdentity;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between rounds of peer probes.
const PROBE_ROUND_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum BootstrapOutcome {
    /// The live data directory was already populated.
    AlreadyInitialized,
    Cloned(CloneReport),
    /// First node of a new cluster: nothing to clone from.
    NoSourceConfigured,
}

pub struct BootstrapController {
    identity: NodeIdentity,
    data_dir: Arc<DataDirectory>,
    clone_manager: CloneManager,
    peers: PeerClient,
    /// Donor hosts, nearest first.
    candidates: Vec<String>,
    bucket: Option<StorageLocation>,
    discovery_timeout: Duration,
    max_lag_secs: u64,
    probe_retry: RetryConfig,
}

impl BootstrapController {
    pub fn new(config: &SidecarConfig, data_dir: Arc<DataDirectory>, tools: &Toolset) -> Result<Self> {
        let identity = NodeIdentity::from_config(&config.node)?;
        let peers = PeerClient::new(&config.backup, config.clone.peer_request_timeout_duration())?;
        let bucket = config
            .clone
            .init_bucket_uri
            .as_deref()
            .map(StorageLocation::parse)
            .transpose()?;
        let clone_manager = CloneManager::new(
            data_dir.clone(),
            tools.extractor.clone(),
            tools.preparer.clone(),
            peers.clone(),
        )
        .with_buffer_size(config.backup.stream_buffer_size)
        .with_prepare(config.clone.prepare)
        .with_resume_attempts(config.clone.download_resume_attempts);
        let candidates = identity
            .donor_candidates()
            .into_iter()
            .map(|ordinal| identity.peer_fqdn(ordinal))
            .collect();

        Ok(Self {
            identity,
            data_dir,
            clone_manager,
            peers,
            candidates,
            bucket,
            discovery_timeout: config.clone.discovery_timeout_duration(),
            max_lag_secs: config.clone.max_replication_lag_duration().as_secs(),
            probe_retry: RetryConfig::peer_probe(),
        })
    }

    /// Replace the derived donor hosts.
    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_bucket(mut self, bucket: Option<StorageLocation>) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn with_probe_retry(mut self, retry: RetryConfig) -> Self {
        self.probe_retry = retry;
        self
    }

    /// Populate the data directory if needed. Errors are always
    /// [`SidecarError::Clone`].
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<BootstrapOutcome> {
        // Local only: a crash during promotion may leave a marker even when
        // the data made it.
        self.data_dir
            .discard_stale_staging()
            .await
            .map_err(SidecarError::into_clone_failure)?;

        if self.data_dir.is_ready().await {
            info!(
                node = %self.identity.hostname,
                path = %self.data_dir.live_path().display(),
                "Data directory already initialised, skipping clone"
            );
            return Ok(BootstrapOutcome::AlreadyInitialized);
        }

        let source = match self
            .select_source(cancel)
            .await
            .map_err(SidecarError::into_clone_failure)?
        {
            Some(source) => source,
            None => {
                info!(node = %self.identity.hostname, "No clone source configured, starting empty");
                return Ok(BootstrapOutcome::NoSourceConfigured);
            }
        };

        self.clone_manager
            .clone(&source, cancel)
            .await
            .map(BootstrapOutcome::Cloned)
            .map_err(SidecarError::into_clone_failure)
    }

    /// Pick a clone source. `Ok(None)` means none is configured at all.
    pub async fn select_source(&self, cancel: &CancellationToken) -> Result<Option<BackupSource>> {
        if self.candidates.is_empty() && self.bucket.is_none() {
            return Ok(None);
        }

        if !self.candidates.is_empty() {
            let found = tokio::time::timeout(self.discovery_timeout, self.find_donor(cancel)).await;
            if cancel.is_cancelled() {
                return Err(SidecarError::Shutdown);
            }
            match found {
                Ok(Some(host)) => return Ok(Some(BackupSource::Peer { host })),
                Ok(None) | Err(_) => warn!(
                    candidates = ?self.candidates,
                    timeout_secs = self.discovery_timeout.as_secs(),
                    "No peer accepted as donor"
                ),
            }
        }

        if let Some(location) = &self.bucket {
            info!(bucket = %location, "Falling back to init bucket");
            return Ok(Some(BackupSource::Bucket {
                location: location.clone(),
            }));
        }

        Err(SidecarError::source_unavailable(
            "peers",
            format!("no acceptable donor among {:?}", self.candidates),
        ))
    }

    /// Probe candidates nearest-first, in rounds, until one is acceptable.
    /// Runs until cancelled; the caller bounds it.
    async fn find_donor(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            for host in &self.candidates {
                let Some(status) = self.peers.probe(host, &self.probe_retry, cancel).await else {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    continue;
                };
                if status.acceptable_donor(self.max_lag_secs) {
                    info!(peer = %host, role = %status.role, lag = ?status.replication_lag_secs, "Selected donor");
                    metrics::record_peer_probe(host, true);
                    return Some(host.clone());
                }
                debug!(
                    peer = %host,
                    data_ready = status.data_ready,
                    lag = ?status.replication_lag_secs,
                    "Peer not acceptable as donor"
                );
                metrics::record_peer_probe(host, false);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(PROBE_ROUND_INTERVAL) => {}
            }
        }
    }
}
