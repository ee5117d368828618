// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process stand-ins for the engine and the snapshot tools.
//!
//! Snapshots in these tests use a tiny format the fakes agree on:
//!
//! ```text
//! <xtrabackup_checkpoints text>\n\n<payload bytes>
//! ```
//!
//! [`FileExtractor`] writes the header to `xtrabackup_checkpoints`, creates
//! the `mysql` schema directory, and streams the payload into `ibdata1`.

use mysql_sidecar::clone::CloneManager;
use mysql_sidecar::config::SidecarConfig;
use mysql_sidecar::datadir::{DataDirectory, CHECKPOINTS_FILE, SYSTEM_SCHEMA_DIR};
use mysql_sidecar::engine::{AdminEngine, BoxFuture, EngineError, ReplicationSource};
use mysql_sidecar::peer::PeerClient;
use mysql_sidecar::server::BackupServer;
use mysql_sidecar::tools::{
    BackupProducer, ExtractSink, ProducedBackup, SnapshotExtractor, SnapshotPreparer, ToolFuture,
};
use mysql_sidecar::{NodeIdentity, NoOpEngine, SidecarError};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Snapshots
// =============================================================================

pub const PAYLOAD_FILE: &str = "ibdata1";

/// A snapshot as the producer would emit it.
pub fn snapshot_bytes(backup_type: &str, to_lsn: u64, payload_len: usize) -> Vec<u8> {
    let mut bytes = format!(
        "backup_type = {backup_type}\nfrom_lsn = 0\nto_lsn = {to_lsn}\nlast_lsn = {to_lsn}\n\n"
    )
    .into_bytes();
    bytes.extend((0..payload_len).map(|i| (i % 251) as u8));
    bytes
}

/// The payload part of a snapshot built by [`snapshot_bytes`].
pub fn payload_of(snapshot: &[u8]) -> &[u8] {
    let split = snapshot
        .windows(2)
        .position(|w| w == b"\n\n")
        .expect("snapshot header");
    &snapshot[split + 2..]
}

// =============================================================================
// Engine
// =============================================================================

/// Records every statement and tracks the replication source they set.
#[derive(Default)]
pub struct RecordingEngine {
    statements: RwLock<Vec<String>>,
    source: RwLock<Option<ReplicationSource>>,
    unavailable_for: AtomicUsize,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls as if the engine were still starting.
    pub fn unavailable_for(&self, n: usize) {
        self.unavailable_for.store(n, Ordering::SeqCst);
    }

    pub async fn set_source(&self, source: Option<ReplicationSource>) {
        *self.source.write().await = source;
    }

    pub async fn source(&self) -> Option<ReplicationSource> {
        self.source.read().await.clone()
    }

    pub async fn statements(&self) -> Vec<String> {
        self.statements.read().await.clone()
    }

    pub async fn clear(&self) {
        self.statements.write().await.clear();
    }

    /// `STOP SLAVE`, `CHANGE MASTER TO ...`, `START SLAVE`.
    pub async fn replication_restarts(&self) -> Vec<String> {
        self.statements
            .read()
            .await
            .iter()
            .filter(|s| s.starts_with("CHANGE MASTER") || s.ends_with(" SLAVE") && !s.starts_with("GRANT"))
            .cloned()
            .collect()
    }

    fn take_unavailable(&self) -> bool {
        self.unavailable_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn value_after<'a>(statement: &'a str, key: &str) -> Option<&'a str> {
    let rest = &statement[statement.find(key)? + key.len()..];
    let rest = rest.trim_start_matches(|c| c == ' ' || c == '=' || c == '\'');
    let end = rest.find(|c| c == '\'' || c == ',')?;
    Some(&rest[..end])
}

impl AdminEngine for RecordingEngine {
    fn execute<'a>(&'a self, statement: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.take_unavailable() {
                return Err(EngineError::Unavailable("connection refused".into()));
            }
            if statement.starts_with("CHANGE MASTER") {
                let host = value_after(statement, "MASTER_HOST").unwrap_or_default().to_string();
                let port = value_after(statement, "MASTER_PORT")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(3306);
                *self.source.write().await = Some(ReplicationSource {
                    host,
                    port,
                    io_running: false,
                    sql_running: false,
                    seconds_behind: None,
                });
            } else if statement == "START SLAVE" {
                if let Some(source) = self.source.write().await.as_mut() {
                    source.io_running = true;
                    source.sql_running = true;
                    source.seconds_behind = Some(0);
                }
            } else if statement == "STOP SLAVE" {
                if let Some(source) = self.source.write().await.as_mut() {
                    source.io_running = false;
                    source.sql_running = false;
                }
            }
            self.statements.write().await.push(statement.to_string());
            Ok(())
        })
    }

    fn replication_source(&self) -> BoxFuture<'_, Option<ReplicationSource>> {
        Box::pin(async move {
            if self.take_unavailable() {
                return Err(EngineError::Unavailable("connection refused".into()));
            }
            Ok(self.source.read().await.clone())
        })
    }
}

// =============================================================================
// Producer
// =============================================================================

/// Emits a fixed snapshot.
///
/// With `hold`, the stream stays open after the data until released, which
/// keeps the server's backup lock taken. With `fail_after`, only that many
/// bytes are sent and the producer then exits non-zero.
#[derive(Default)]
pub struct FakeProducer {
    pub data: Vec<u8>,
    pub hold: Option<Arc<Notify>>,
    pub fail_after: Option<usize>,
    pub produced: AtomicUsize,
}

impl FakeProducer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn held(data: Vec<u8>) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                data,
                hold: Some(gate.clone()),
                ..Default::default()
            },
            gate,
        )
    }

    pub fn failing_after(data: Vec<u8>, bytes: usize) -> Self {
        Self {
            data,
            fail_after: Some(bytes),
            ..Default::default()
        }
    }
}

impl BackupProducer for FakeProducer {
    fn produce(&self) -> ToolFuture<'_, ProducedBackup> {
        Box::pin(async move {
            self.produced.fetch_add(1, Ordering::SeqCst);
            let (reader, mut writer) = tokio::io::duplex(16 * 1024);
            let end = self.fail_after.unwrap_or(self.data.len()).min(self.data.len());
            let data = self.data[..end].to_vec();
            let hold = self.hold.clone();
            let failed = self.fail_after.is_some();

            let feeder = tokio::spawn(async move {
                let _ = writer.write_all(&data).await;
                if let Some(gate) = hold {
                    gate.notified().await;
                }
                let _ = writer.shutdown().await;
            });

            Ok(ProducedBackup {
                stream: Box::new(reader),
                completion: Box::pin(async move {
                    let _ = feeder.await;
                    if failed {
                        Err(SidecarError::StreamInterrupted("xtrabackup exited with 1".into()))
                    } else {
                        Ok(())
                    }
                }),
            })
        })
    }
}

// =============================================================================
// Extractor / preparer
// =============================================================================

/// Unpacks the test snapshot format into a directory.
#[derive(Default)]
pub struct FileExtractor;

impl SnapshotExtractor for FileExtractor {
    fn extract<'a>(&'a self, dest: &'a Path) -> ToolFuture<'a, ExtractSink> {
        Box::pin(async move {
            let (writer, mut reader) = tokio::io::duplex(16 * 1024);
            let dest = dest.to_path_buf();
            let task = tokio::spawn(async move {
                let mut header = Vec::new();
                let mut byte = [0u8; 1];
                while !header.ends_with(b"\n\n") {
                    if reader.read(&mut byte).await? == 0 {
                        return Err(SidecarError::StreamInterrupted("snapshot header truncated".into()));
                    }
                    header.push(byte[0]);
                }
                tokio::fs::write(dest.join(CHECKPOINTS_FILE), &header).await?;
                tokio::fs::create_dir_all(dest.join(SYSTEM_SCHEMA_DIR)).await?;
                let mut file = tokio::fs::File::create(dest.join(PAYLOAD_FILE)).await?;
                tokio::io::copy(&mut reader, &mut file).await?;
                file.sync_all().await?;
                Ok::<(), SidecarError>(())
            });
            let task = AbortOnDrop(task);
            Ok(ExtractSink {
                writer: Box::new(writer),
                completion: Box::pin(async move { task.join().await }),
            })
        })
    }
}

/// Stops the extraction task when the sink is abandoned, like killing the
/// real tool.
struct AbortOnDrop(JoinHandle<mysql_sidecar::Result<()>>);

impl AbortOnDrop {
    async fn join(mut self) -> mysql_sidecar::Result<()> {
        match (&mut self.0).await {
            Ok(result) => result,
            Err(e) => Err(SidecarError::Internal(format!("extractor task: {e}"))),
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Marks a snapshot prepared, as `xtrabackup --prepare` would.
#[derive(Default)]
pub struct FakePreparer;

impl SnapshotPreparer for FakePreparer {
    fn prepare<'a>(&'a self, dir: &'a Path) -> ToolFuture<'a, ()> {
        Box::pin(async move {
            let path = dir.join(CHECKPOINTS_FILE);
            let text = tokio::fs::read_to_string(&path).await?;
            tokio::fs::write(&path, text.replace("full-backuped", "full-prepared")).await?;
            Ok(())
        })
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// A Backup Server on an ephemeral local port.
pub struct TestServer {
    pub host: String,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<mysql_sidecar::Result<()>>,
}

impl TestServer {
    pub async fn start(hostname: &str, producer: Arc<dyn BackupProducer>) -> Self {
        Self::start_with(SidecarConfig::for_testing(hostname), producer).await
    }

    pub async fn start_with(config: SidecarConfig, producer: Arc<dyn BackupProducer>) -> Self {
        let identity = NodeIdentity::from_config(&config.node).unwrap();
        let data = tempfile::tempdir().unwrap().into_path();
        std::fs::create_dir_all(data.join(SYSTEM_SCHEMA_DIR)).unwrap();
        let server = BackupServer::new(
            &config,
            identity,
            producer,
            Arc::new(NoOpEngine),
            Arc::new(DataDirectory::new(data)),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.serve(listener, cancel.clone()));
        Self { host, cancel, handle }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.host, path)
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.handle).await;
    }
}

pub fn peer_client(config: &SidecarConfig) -> PeerClient {
    PeerClient::new(&config.backup, Duration::from_secs(2)).unwrap()
}

/// Clone Manager wired to the fakes.
pub fn clone_manager(data_dir: Arc<DataDirectory>, config: &SidecarConfig) -> CloneManager {
    CloneManager::new(
        data_dir,
        Arc::new(FileExtractor),
        Arc::new(FakePreparer),
        peer_client(config),
    )
    .with_buffer_size(config.backup.stream_buffer_size)
}
