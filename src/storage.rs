// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object storage for backup artifacts.
//!
//! Locations are URIs: `s3://bucket/prefix/`, `gs://bucket/prefix/`,
//! `file:///abs/dir/`, or `memory:///` (process-local, for tests). A trailing
//! `/` names a directory: uploads get a generated object name, and clones
//! pick the newest artifact under it.
//!
//! # Artifact layout
//!
//! ```text
//! <prefix>/db-20260102T030405Z.xbackup.zst                 zstd-compressed xbstream
//! <prefix>/db-20260102T030405Z.xbackup.zst.manifest.json   written after the upload commits
//! ```

use crate::error::{Result, SidecarError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{GetOptions, GetRange, ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// Suffix of compressed backup artifacts.
pub const ARTIFACT_SUFFIX: &str = ".xbackup.zst";

/// Suffix of uncompressed artifacts (accepted when cloning).
pub const RAW_ARTIFACT_SUFFIX: &str = ".xbackup";

/// Suffix appended to an artifact path to name its manifest.
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Multipart part buffer. S3 requires parts of at least 5 MiB.
const UPLOAD_PART_SIZE: usize = 8 * 1024 * 1024;

/// A parsed storage location.
#[derive(Clone)]
pub struct StorageLocation {
    store: Arc<dyn ObjectStore>,
    path: Path,
    is_dir: bool,
    uri: String,
}

impl fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLocation")
            .field("uri", &self.uri)
            .field("is_dir", &self.is_dir)
            .finish()
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl StorageLocation {
    /// Open a location by URI. Cloud credentials come from the environment.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = url::Url::parse(uri)
            .map_err(|e| SidecarError::ConfigInvalid(format!("invalid storage URI '{uri}': {e}")))?;
        let store: Arc<dyn ObjectStore> = match url.scheme() {
            "s3" | "s3a" => Arc::new(AmazonS3Builder::from_env().with_url(uri).build()?),
            "gs" => Arc::new(GoogleCloudStorageBuilder::from_env().with_url(uri).build()?),
            "file" => Arc::new(LocalFileSystem::new()),
            "memory" => Arc::new(InMemory::new()),
            other => {
                return Err(SidecarError::ConfigInvalid(format!(
                    "unsupported storage scheme '{other}' in '{uri}'"
                )))
            }
        };
        Ok(Self::with_store(store, url.path(), uri))
    }

    /// Wrap an existing store. `path` may end with `/` to denote a directory.
    pub fn with_store(store: Arc<dyn ObjectStore>, path: &str, uri: &str) -> Self {
        let trimmed = path.trim_matches('/');
        Self {
            store,
            path: Path::from(trimmed),
            is_dir: trimmed.is_empty() || path.ends_with('/') || uri.ends_with('/'),
            uri: uri.to_string(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Object to upload to: the path itself, or a generated name under it.
    pub fn upload_target(&self, cluster: &str, started_at: DateTime<Utc>) -> Path {
        if self.is_dir {
            let name = format!("{}-{}{}", cluster, started_at.format("%Y%m%dT%H%M%SZ"), ARTIFACT_SUFFIX);
            self.path.child(name)
        } else {
            self.path.clone()
        }
    }

    /// Newest artifact at this location.
    ///
    /// A file location resolves to itself; a directory to the most recently
    /// modified artifact under it.
    pub async fn resolve_latest(&self) -> Result<Path> {
        if !self.is_dir {
            self.store.head(&self.path).await.map_err(|e| {
                SidecarError::source_unavailable(self.uri.clone(), e.to_string())
            })?;
            return Ok(self.path.clone());
        }

        let prefix = (!self.path.as_ref().is_empty()).then_some(&self.path);
        let objects: Vec<_> = self
            .store
            .list(prefix)
            .try_collect()
            .await
            .map_err(|e| SidecarError::source_unavailable(self.uri.clone(), e.to_string()))?;

        objects
            .into_iter()
            .filter(|meta| is_artifact(&meta.location))
            .max_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.location.as_ref().cmp(b.location.as_ref()))
            })
            .map(|meta| {
                debug!(object = %meta.location, size = meta.size, "Resolved latest artifact");
                meta.location
            })
            .ok_or_else(|| {
                SidecarError::source_unavailable(self.uri.clone(), "no backup artifacts found")
            })
    }
}

fn is_artifact(path: &Path) -> bool {
    let s = path.as_ref();
    s.ends_with(ARTIFACT_SUFFIX) || s.ends_with(RAW_ARTIFACT_SUFFIX)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resumable download
// ═══════════════════════════════════════════════════════════════════════════════

struct Download {
    store: Arc<dyn ObjectStore>,
    path: Path,
    etag: Option<String>,
    offset: usize,
    resumes_left: u32,
    inner: Option<BoxStream<'static, object_store::Result<Bytes>>>,
    done: bool,
}

impl Download {
    async fn open(&mut self) -> object_store::Result<()> {
        let options = GetOptions {
            // Resuming against a replaced object would splice two snapshots.
            if_match: self.etag.clone(),
            range: (self.offset > 0).then_some(GetRange::Offset(self.offset)),
            ..Default::default()
        };
        let result = self.store.get_opts(&self.path, options).await?;
        if self.etag.is_none() {
            self.etag = result.meta.e_tag.clone();
        }
        self.inner = Some(result.into_stream());
        Ok(())
    }

    async fn next_chunk(&mut self) -> Option<std::io::Result<Bytes>> {
        loop {
            if self.done {
                return None;
            }
            if self.inner.is_none() {
                if let Err(e) = self.open().await {
                    if !self.spend_resume(&e) {
                        self.done = true;
                        return Some(Err(to_io(e)));
                    }
                    continue;
                }
            }
            let inner = self.inner.as_mut()?;
            match inner.next().await {
                Some(Ok(bytes)) => {
                    self.offset += bytes.len();
                    return Some(Ok(bytes));
                }
                Some(Err(e)) => {
                    self.inner = None;
                    if !self.spend_resume(&e) {
                        self.done = true;
                        return Some(Err(to_io(e)));
                    }
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    fn spend_resume(&mut self, e: &object_store::Error) -> bool {
        let resumable = !matches!(
            e,
            object_store::Error::NotFound { .. } | object_store::Error::Precondition { .. }
        );
        if !resumable || self.resumes_left == 0 {
            return false;
        }
        self.resumes_left -= 1;
        warn!(
            object = %self.path,
            offset = self.offset,
            resumes_left = self.resumes_left,
            error = %e,
            "Download interrupted, resuming"
        );
        true
    }
}

fn to_io(e: object_store::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

/// Stream an object, resuming with ranged reads after transient failures.
pub fn download(
    store: Arc<dyn ObjectStore>,
    path: Path,
    resume_attempts: u32,
) -> impl AsyncRead + Send + Unpin + 'static {
    let state = Download {
        store,
        path,
        etag: None,
        offset: 0,
        resumes_left: resume_attempts,
        inner: None,
        done: false,
    };
    let stream = futures::stream::unfold(state, |mut state| async move {
        let item = state.next_chunk().await?;
        Some((item, state))
    });
    StreamReader::new(Box::pin(stream))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Upload and manifest
// ═══════════════════════════════════════════════════════════════════════════════

/// Buffered multipart writer. Call `shutdown()` to commit or `abort()` to
/// discard; nothing is visible at `path` before a successful commit.
pub fn upload_writer(store: Arc<dyn ObjectStore>, path: Path, max_concurrency: usize) -> BufWriter {
    BufWriter::with_capacity(store, path, UPLOAD_PART_SIZE).with_max_concurrency(max_concurrency.max(1))
}

/// Describes a committed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Bytes received from the source.
    pub raw_bytes: u64,
    /// Bytes written to storage.
    pub stored_bytes: u64,
    /// Hex SHA-256 of the raw stream.
    pub sha256: String,
    pub compression: String,
}

pub fn manifest_path(artifact: &Path) -> Path {
    Path::from(format!("{}{}", artifact, MANIFEST_SUFFIX))
}

pub async fn write_manifest(
    store: &dyn ObjectStore,
    artifact: &Path,
    manifest: &BackupManifest,
) -> Result<Path> {
    let path = manifest_path(artifact);
    let body = serde_json::to_vec_pretty(manifest)
        .map_err(|e| SidecarError::Internal(format!("serialize manifest: {e}")))?;
    store.put(&path, PutPayload::from(body)).await?;
    info!(manifest = %path, "Wrote backup manifest");
    Ok(path)
}

pub async fn read_manifest(store: &dyn ObjectStore, artifact: &Path) -> Result<BackupManifest> {
    let bytes = store.get(&manifest_path(artifact)).await?.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SidecarError::Internal(format!("parse manifest: {e}")))
}
