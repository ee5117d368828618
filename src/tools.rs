// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot tooling capabilities.
//!
//! The sidecar does not understand the on-disk format of a snapshot. It
//! relies on three capabilities:
//!
//! - [`BackupProducer`]: emits a full snapshot as a byte stream
//! - [`SnapshotExtractor`]: unpacks such a stream into a directory
//! - [`SnapshotPreparer`]: makes an unpacked snapshot consistent
//!
//! [`XtraBackup`] implements all three by running `xtrabackup` and `xbstream`
//! as child processes. Children are killed when their handles are dropped, so
//! aborting a request also stops the tool.

use crate::config::ToolsConfig;
use crate::error::{Result, SidecarError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Boxed future returning a sidecar result.
pub type ToolFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A running backup: the bytes, and how it ended.
///
/// `completion` resolves once the producer has exited; an `Err` means the
/// stream must be treated as broken even if it reached EOF.
pub struct ProducedBackup {
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
    pub completion: ToolFuture<'static, ()>,
}

/// A running extraction: write the snapshot into `writer`, shut it down,
/// then await `completion`.
pub struct ExtractSink {
    // Dropped before `writer`, so an abandoned extraction is stopped before
    // it sees EOF and mistakes a truncated stream for a complete one.
    pub completion: ToolFuture<'static, ()>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

pub trait BackupProducer: Send + Sync + 'static {
    /// Start producing a full snapshot of the local engine.
    fn produce(&self) -> ToolFuture<'_, ProducedBackup>;
}

pub trait SnapshotExtractor: Send + Sync + 'static {
    /// Start unpacking a snapshot stream into `dest`, which exists and is empty.
    fn extract<'a>(&'a self, dest: &'a Path) -> ToolFuture<'a, ExtractSink>;
}

pub trait SnapshotPreparer: Send + Sync + 'static {
    /// Apply logs so the snapshot at `dir` is consistent.
    fn prepare<'a>(&'a self, dir: &'a Path) -> ToolFuture<'a, ()>;
}

/// The three capabilities bundled, as passed through the CLI handlers.
#[derive(Clone)]
pub struct Toolset {
    pub producer: Arc<dyn BackupProducer>,
    pub extractor: Arc<dyn SnapshotExtractor>,
    pub preparer: Arc<dyn SnapshotPreparer>,
}

impl Toolset {
    pub fn xtrabackup(tools: &ToolsConfig, data_dir: &Path, admin_url: &str) -> Result<Self> {
        let xb = Arc::new(XtraBackup::new(tools, data_dir, admin_url)?);
        Ok(Self {
            producer: xb.clone(),
            extractor: xb.clone(),
            preparer: xb,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// xtrabackup / xbstream subprocesses
// ═══════════════════════════════════════════════════════════════════════════════

/// Keep this much of a tool's stderr for error messages.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone)]
pub struct XtraBackup {
    xtrabackup: String,
    xbstream: String,
    data_dir: PathBuf,
    connection_args: Vec<String>,
    extra_backup_args: Vec<String>,
}

impl XtraBackup {
    /// Connection flags are derived from the admin URL so credentials live in
    /// one place.
    pub fn new(tools: &ToolsConfig, data_dir: &Path, admin_url: &str) -> Result<Self> {
        Ok(Self {
            xtrabackup: tools.xtrabackup.clone(),
            xbstream: tools.xbstream.clone(),
            data_dir: data_dir.to_path_buf(),
            connection_args: connection_args(admin_url)?,
            extra_backup_args: tools.backup_args.clone(),
        })
    }

    fn backup_command(&self) -> Command {
        let mut cmd = Command::new(&self.xtrabackup);
        cmd.arg("--backup")
            .arg("--slave-info")
            .arg("--stream=xbstream")
            .arg(format!("--datadir={}", self.data_dir.display()))
            .arg("--target-dir=/tmp")
            .args(&self.connection_args)
            .args(&self.extra_backup_args);
        cmd
    }
}

fn connection_args(admin_url: &str) -> Result<Vec<String>> {
    let url = url::Url::parse(admin_url)
        .map_err(|e| SidecarError::ConfigInvalid(format!("invalid engine.admin_url: {e}")))?;
    let mut args = Vec::new();
    if let Some(host) = url.host_str() {
        args.push(format!("--host={host}"));
    }
    if let Some(port) = url.port() {
        args.push(format!("--port={port}"));
    }
    if !url.username().is_empty() {
        args.push(format!("--user={}", url.username()));
    }
    if let Some(password) = url.password() {
        args.push(format!("--password={password}"));
    }
    Ok(args)
}

/// Supervise a spawned tool: drain its stderr in the background (a full
/// pipe would stall the tool), and resolve once it exits. A non-zero exit is
/// an error carrying the tail of stderr.
fn supervise(tool: &'static str, mut child: Child) -> ToolFuture<'static, ()> {
    let drain = child.stderr.take().map(|pipe| {
        tokio::spawn(async move {
            let mut tail = String::new();
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(tool, line = %line, "tool stderr");
                tail.push_str(&line);
                tail.push('\n');
                if tail.len() > 2 * STDERR_TAIL {
                    let cut = tail.len() - STDERR_TAIL;
                    let cut = (cut..tail.len())
                        .find(|i| tail.is_char_boundary(*i))
                        .unwrap_or(tail.len());
                    tail.replace_range(..cut, "");
                }
            }
            tail
        })
    });

    Box::pin(async move {
        let status = child.wait().await?;
        let stderr = match drain {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        if status.success() {
            debug!(tool, "Tool exited successfully");
            return Ok(());
        }
        Err(SidecarError::StreamInterrupted(format!(
            "{tool} exited with {status}: {}",
            stderr.trim()
        )))
    })
}

impl BackupProducer for XtraBackup {
    fn produce(&self) -> ToolFuture<'_, ProducedBackup> {
        Box::pin(async move {
            let mut child = self
                .backup_command()
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| SidecarError::Internal(format!("spawn {}: {e}", self.xtrabackup)))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| SidecarError::Internal("xtrabackup stdout not piped".into()))?;
            info!(pid = ?child.id(), "Started xtrabackup");
            Ok(ProducedBackup {
                stream: Box::new(stdout),
                completion: supervise("xtrabackup", child),
            })
        })
    }
}

impl SnapshotExtractor for XtraBackup {
    fn extract<'a>(&'a self, dest: &'a Path) -> ToolFuture<'a, ExtractSink> {
        Box::pin(async move {
            let mut child = Command::new(&self.xbstream)
                .arg("-x")
                .arg("-C")
                .arg(dest)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| SidecarError::Internal(format!("spawn {}: {e}", self.xbstream)))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| SidecarError::Internal("xbstream stdin not piped".into()))?;
            Ok(ExtractSink {
                writer: Box::new(stdin),
                completion: supervise("xbstream", child),
            })
        })
    }
}

impl SnapshotPreparer for XtraBackup {
    fn prepare<'a>(&'a self, dir: &'a Path) -> ToolFuture<'a, ()> {
        Box::pin(async move {
            info!(dir = %dir.display(), "Preparing snapshot");
            let child = Command::new(&self.xtrabackup)
                .arg("--prepare")
                .arg(format!("--target-dir={}", dir.display()))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| SidecarError::Internal(format!("spawn {}: {e}", self.xtrabackup)))?;
            supervise("xtrabackup --prepare", child)
                .await
                .map_err(|e| SidecarError::VerificationFailed(e.to_string()))
        })
    }
}
