// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local data directory lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!           begin_staging()            promote()
//! Absent ───────────────────→ Cloning ───────────→ Ready
//!                                │
//!                                │ discard() / mark_failed()
//!                                ↓
//!                             Failed  (terminal for this process)
//! ```
//!
//! The live path is usually a volume mount point, so it is never removed or
//! renamed. A clone is written to a staging directory inside it (same
//! filesystem) and promoted by moving the staged entries up one level, the
//! system schema directory last: its arrival is what makes the directory
//! ready. A marker file brackets the moves, so a crash half way is rolled
//! back on the next attempt instead of being mistaken for foreign data.

use crate::error::{Result, SidecarError};
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Staging directory, inside the live path.
pub const STAGING_DIR: &str = ".clone-staging";

/// Present while staged entries are being moved into the live path.
pub const PROMOTING_MARKER: &str = ".clone-promoting";

/// Created by `mkfs` at the root of a fresh volume.
pub const LOST_AND_FOUND: &str = "lost+found";

/// Name of the system schema directory whose presence means "initialised".
pub const SYSTEM_SCHEMA_DIR: &str = "mysql";

/// Metadata file written by xtrabackup next to the snapshot.
pub const CHECKPOINTS_FILE: &str = "xtrabackup_checkpoints";

/// Entries of the live path that do not count as data.
fn is_housekeeping(name: &OsStr) -> bool {
    name == LOST_AND_FOUND || name == STAGING_DIR || name == PROMOTING_MARKER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    Absent,
    Cloning,
    Ready,
    Failed,
}

impl fmt::Display for DataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataState::Absent => write!(f, "Absent"),
            DataState::Cloning => write!(f, "Cloning"),
            DataState::Ready => write!(f, "Ready"),
            DataState::Failed => write!(f, "Failed"),
        }
    }
}

/// The live data directory and the staging directory inside it.
#[derive(Debug)]
pub struct DataDirectory {
    live: PathBuf,
    staging: PathBuf,
    marker: PathBuf,
    failed: AtomicBool,
}

/// A staging directory handed out by [`DataDirectory::begin_staging`].
///
/// Promote it, or hand it back to [`DataDirectory::discard`].
#[derive(Debug)]
#[must_use]
pub struct Staging {
    path: PathBuf,
    /// The live path did not exist before staging created it.
    created_live: bool,
}

impl Staging {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataDirectory {
    pub fn new(live: impl Into<PathBuf>) -> Self {
        let live = live.into();
        Self {
            staging: live.join(STAGING_DIR),
            marker: live.join(PROMOTING_MARKER),
            live,
            failed: AtomicBool::new(false),
        }
    }

    pub fn live_path(&self) -> &Path {
        &self.live
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub async fn state(&self) -> DataState {
        if self.failed.load(Ordering::SeqCst) {
            return DataState::Failed;
        }
        if self.is_ready().await {
            return DataState::Ready;
        }
        if exists(&self.staging).await || exists(&self.marker).await {
            return DataState::Cloning;
        }
        DataState::Absent
    }

    /// Live path holds an initialised database.
    pub async fn is_ready(&self) -> bool {
        tokio::fs::metadata(self.live.join(SYSTEM_SCHEMA_DIR))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Clean up after a crashed run: roll back a half-finished promotion and
    /// remove staging. Returns whether anything was removed.
    pub async fn discard_stale_staging(&self) -> Result<bool> {
        let rolled_back = self.recover_promotion().await?;
        match tokio::fs::remove_dir_all(&self.staging).await {
            Ok(()) => {
                warn!(path = %self.staging.display(), "Discarded stale clone staging");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(rolled_back),
            Err(e) => Err(self.unusable("remove stale staging", e)),
        }
    }

    /// Absent → Cloning.
    ///
    /// Refuses a live path that already holds data it did not put there,
    /// before anything is downloaded.
    pub async fn begin_staging(&self) -> Result<Staging> {
        match self.state().await {
            DataState::Absent => {}
            DataState::Cloning => {
                self.discard_stale_staging().await?;
            }
            other => {
                return Err(SidecarError::InvalidState {
                    expected: DataState::Absent.to_string(),
                    actual: other.to_string(),
                })
            }
        }
        let created_live = !exists(&self.live).await;
        if !created_live {
            self.ensure_no_data().await?;
        }
        tokio::fs::create_dir_all(&self.staging)
            .await
            .map_err(|e| self.unusable("create staging", e))?;
        debug!(path = %self.staging.display(), created_live, "Created clone staging");
        Ok(Staging {
            path: self.staging.clone(),
            created_live,
        })
    }

    /// Cloning → Ready.
    ///
    /// Staged entries are renamed into the live path, the system schema
    /// directory last. The live path itself is never replaced, so it may be a
    /// mount point. It must hold no data (`lost+found` is fine). On failure
    /// the entries already moved are removed again and staging is kept for
    /// the caller to discard.
    pub async fn promote(&self, staging: &Staging) -> Result<()> {
        self.ensure_no_data().await?;
        tokio::fs::write(&self.marker, b"")
            .await
            .map_err(|e| self.unusable("mark promotion", e))?;
        sync_dir(&self.live).await;

        if let Err(e) = self.move_entries(&staging.path).await {
            // The marker stays if the rollback fails, so the next attempt retries it.
            if let Err(cleanup) = self.clear_data().await {
                warn!(path = %self.live.display(), error = %cleanup, "Failed to roll back promotion");
            } else if let Err(cleanup) = tokio::fs::remove_file(&self.marker).await {
                warn!(path = %self.marker.display(), error = %cleanup, "Failed to remove promotion marker");
            }
            return Err(e);
        }
        sync_dir(&self.live).await;

        if let Err(e) = tokio::fs::remove_file(&self.marker).await {
            warn!(path = %self.marker.display(), error = %e, "Failed to remove promotion marker");
        }
        if let Err(e) = tokio::fs::remove_dir(&staging.path).await {
            warn!(path = %staging.path.display(), error = %e, "Failed to remove emptied staging");
        }
        info!(path = %self.live.display(), "Promoted clone to live data directory");
        Ok(())
    }

    async fn move_entries(&self, from: &Path) -> Result<()> {
        let mut entries = tokio::fs::read_dir(from)
            .await
            .map_err(|e| self.unusable("read staging", e))?;
        let mut schema = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.unusable("read staging", e))?
        {
            let name = entry.file_name();
            if name == SYSTEM_SCHEMA_DIR {
                schema = Some(entry.path());
                continue;
            }
            tokio::fs::rename(entry.path(), self.live.join(&name))
                .await
                .map_err(|e| self.unusable("move staged entry", e))?;
        }

        let Some(schema) = schema else {
            return Err(SidecarError::VerificationFailed(format!(
                "staging has no '{SYSTEM_SCHEMA_DIR}' schema directory"
            )));
        };
        // Commit point.
        tokio::fs::rename(&schema, self.live.join(SYSTEM_SCHEMA_DIR))
            .await
            .map_err(|e| self.unusable("move system schema", e))
    }

    /// Drop a staging directory after a failed clone.
    pub async fn discard(&self, staging: Staging) {
        if let Err(e) = tokio::fs::remove_dir_all(&staging.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %staging.path.display(), error = %e, "Failed to remove clone staging");
            }
        }
        if staging.created_live {
            // Only succeeds while empty.
            if let Err(e) = tokio::fs::remove_dir(&self.live).await {
                debug!(path = %self.live.display(), error = %e, "Left data directory in place");
            }
        }
    }

    /// Any state → Failed. Sticky for the lifetime of this value.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// A marker without the system schema means the moves were cut short.
    async fn recover_promotion(&self) -> Result<bool> {
        if !exists(&self.marker).await {
            return Ok(false);
        }
        let rolled_back = if self.is_ready().await {
            info!(path = %self.live.display(), "Previous promotion had completed");
            false
        } else {
            warn!(path = %self.live.display(), "Rolling back interrupted promotion");
            self.clear_data().await?;
            true
        };
        tokio::fs::remove_file(&self.marker)
            .await
            .map_err(|e| self.unusable("remove promotion marker", e))?;
        Ok(rolled_back)
    }

    /// Remove every non-housekeeping entry of the live path.
    async fn clear_data(&self) -> Result<()> {
        for path in self.data_entries().await? {
            let removed = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.unusable("remove partial promotion", e)),
            }
        }
        Ok(())
    }

    async fn ensure_no_data(&self) -> Result<()> {
        let found = self.data_entries().await?;
        if found.is_empty() {
            return Ok(());
        }
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        Err(SidecarError::ConfigInvalid(format!(
            "refusing to clone into non-empty data directory {} (found {:?})",
            self.live.display(),
            names
        )))
    }

    /// Entries of the live path other than housekeeping. Empty when the live
    /// path does not exist.
    async fn data_entries(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.live).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.unusable("read data directory", e)),
        };
        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.unusable("read data directory", e))?
        {
            if !is_housekeeping(&entry.file_name()) {
                found.push(entry.path());
            }
        }
        Ok(found)
    }

    fn unusable(&self, action: &str, e: io::Error) -> SidecarError {
        SidecarError::ConfigInvalid(format!(
            "cannot {action} in data directory {}: {e}",
            self.live.display()
        ))
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Make renames inside `dir` durable. Not every filesystem supports fsync on
/// directories.
async fn sync_dir(dir: &Path) {
    let dir = dir.to_path_buf();
    let synced = tokio::task::spawn_blocking({
        let dir = dir.clone();
        move || std::fs::File::open(&dir).and_then(|f| f.sync_all())
    })
    .await;
    match synced {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(
            path = %dir.display(),
            error = %e,
            "Directory fsync failed, renames may not be durable"
        ),
        Err(e) => debug!(path = %dir.display(), error = %e, "Directory fsync task failed"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot verification
// ═══════════════════════════════════════════════════════════════════════════════

/// Parsed `xtrabackup_checkpoints`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoints {
    pub backup_type: String,
    pub from_lsn: u64,
    pub to_lsn: u64,
    pub last_lsn: Option<u64>,
}

impl Checkpoints {
    /// Parse `key = value` lines. Unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut backup_type = None;
        let mut from_lsn = None;
        let mut to_lsn = None;
        let mut last_lsn = None;

        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            let lsn = || {
                value.parse::<u64>().map_err(|_| {
                    SidecarError::VerificationFailed(format!("{} is not an LSN: '{value}'", key.trim()))
                })
            };
            match key.trim() {
                "backup_type" => backup_type = Some(value.to_string()),
                "from_lsn" => from_lsn = Some(lsn()?),
                "to_lsn" => to_lsn = Some(lsn()?),
                "last_lsn" => last_lsn = Some(lsn()?),
                _ => {}
            }
        }

        let missing = |field: &str| SidecarError::VerificationFailed(format!("checkpoints missing {field}"));
        Ok(Self {
            backup_type: backup_type.ok_or_else(|| missing("backup_type"))?,
            from_lsn: from_lsn.ok_or_else(|| missing("from_lsn"))?,
            to_lsn: to_lsn.ok_or_else(|| missing("to_lsn"))?,
            last_lsn,
        })
    }

    /// A complete, self-contained full snapshot.
    pub fn check_full(&self, require_prepared: bool) -> Result<()> {
        let accepted: &[&str] = if require_prepared {
            &["full-prepared"]
        } else {
            &["full-backuped", "full-prepared"]
        };
        if !accepted.contains(&self.backup_type.as_str()) {
            return Err(SidecarError::VerificationFailed(format!(
                "backup_type '{}' is not one of {:?}",
                self.backup_type, accepted
            )));
        }
        if self.from_lsn != 0 {
            return Err(SidecarError::VerificationFailed(format!(
                "from_lsn {} != 0: not a full backup",
                self.from_lsn
            )));
        }
        if self.to_lsn == 0 {
            return Err(SidecarError::VerificationFailed("to_lsn is 0".into()));
        }
        if let Some(last) = self.last_lsn {
            if last < self.to_lsn {
                return Err(SidecarError::VerificationFailed(format!(
                    "last_lsn {} < to_lsn {}",
                    last, self.to_lsn
                )));
            }
        }
        Ok(())
    }
}

/// Check that `dir` holds a consistent full snapshot.
pub async fn verify_snapshot(dir: &Path, require_prepared: bool) -> Result<Checkpoints> {
    let path = dir.join(CHECKPOINTS_FILE);
    let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
        SidecarError::VerificationFailed(format!("cannot read {}: {}", path.display(), e))
    })?;
    let checkpoints = Checkpoints::parse(&text)?;
    checkpoints.check_full(require_prepared)?;

    let schema = tokio::fs::metadata(dir.join(SYSTEM_SCHEMA_DIR))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !schema {
        return Err(SidecarError::VerificationFailed(format!(
            "snapshot has no '{SYSTEM_SCHEMA_DIR}' schema directory"
        )));
    }
    Ok(checkpoints)
}
