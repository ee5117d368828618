// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the MySQL sidecar
//!
//! Everything except `engine_configure_*` runs in process: a real Backup
//! Server on a loopback port, an in-memory object store, and fakes for the
//! snapshot tools and the engine (see `common::fakes`).
//!
//! # Running Tests
//! ```bash
//! # In-process tests
//! cargo test --test integration
//!
//! # Tests against a MySQL container (requires Docker / OrbStack)
//! cargo test --test integration engine_configure -- --ignored
//! ```
//!
//! # Test Organization
//! - `backup_*` - Backup Server to Backup Client to bucket
//! - `clone_*` - Clone Manager from a peer or a bucket
//! - `bootstrap_*` - Source selection
//! - `configure_*` - Config Engine against a recording engine
//! - `engine_*` - Config Engine against a real MySQL

mod common;

use common::{
    clone_manager, mysql_container, mysql_url, payload_of, peer_client, snapshot_bytes, FakePreparer,
    FakeProducer, FileExtractor, RecordingEngine, TestServer, PAYLOAD_FILE,
};
use mysql_sidecar::config::Account;
use mysql_sidecar::configure::DYNAMIC_CONF_FILE;
use mysql_sidecar::datadir::SYSTEM_SCHEMA_DIR;
use mysql_sidecar::resilience::RetryConfig;
use mysql_sidecar::storage::{read_manifest, ARTIFACT_SUFFIX};
use mysql_sidecar::stream::maybe_decompress;
use mysql_sidecar::{
    AdminEngine, BackupClient, BackupSource, BootstrapController, BootstrapOutcome, ConfigEngine,
    DataDirectory, MySqlEngine, ReplicationSource, Role, SidecarConfig, SidecarError, StorageLocation,
    Toolset,
};
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use testcontainers::clients::Cli;
use tokio_util::sync::CancellationToken;

fn memory_bucket() -> (Arc<InMemory>, StorageLocation) {
    let store = Arc::new(InMemory::new());
    let location = StorageLocation::with_store(store.clone(), "backups/db/", "memory:///backups/db/");
    (store, location)
}

async fn object_count(store: &InMemory) -> usize {
    use futures::TryStreamExt;
    let objects: Vec<_> = store.list(None).try_collect().await.unwrap();
    objects.len()
}

/// Put a zstd-compressed snapshot where a previous upload would have left it.
async fn seed_bucket(store: &InMemory, name: &str, snapshot: &[u8]) -> ObjectPath {
    let path = ObjectPath::from(format!("backups/db/{name}{ARTIFACT_SUFFIX}"));
    let compressed = zstd::encode_all(snapshot, 3).unwrap();
    store.put(&path, PutPayload::from(compressed)).await.unwrap();
    path
}

fn fake_tools(producer: Arc<FakeProducer>) -> Toolset {
    Toolset {
        producer,
        extractor: Arc::new(FileExtractor),
        preparer: Arc::new(FakePreparer),
    }
}

fn replica_config(hostname: &str, conf_dir: &std::path::Path) -> SidecarConfig {
    let mut config = SidecarConfig::for_testing(hostname);
    config.paths.conf_dir = conf_dir.to_path_buf();
    config.accounts.replication = Some(Account::new("repl", "repl-pw"));
    config.accounts.metrics = Some(Account::new("exporter", "metrics-pw"));
    config
}

// =============================================================================
// Backup Server → Backup Client → bucket
// =============================================================================

#[tokio::test]
async fn backup_lands_in_bucket_with_manifest() {
    let snapshot = snapshot_bytes("full-backuped", 42, 300_000);
    let server = TestServer::start("db-mysql-0", Arc::new(FakeProducer::new(snapshot.clone()))).await;
    let (store, destination) = memory_bucket();

    let client = BackupClient::new(&SidecarConfig::for_testing("db-mysql-1")).unwrap();
    let report = client
        .take_backup(&server.host, &destination, &CancellationToken::new())
        .await
        .expect("backup should succeed");

    assert!(report.object.as_ref().starts_with("backups/db/db-"));
    assert!(report.object.as_ref().ends_with(ARTIFACT_SUFFIX));
    assert_eq!(report.stats.bytes_in, snapshot.len() as u64);

    let stored = store.get(&report.object).await.unwrap().bytes().await.unwrap();
    assert_eq!(maybe_decompress(&stored).unwrap(), snapshot);

    let manifest = read_manifest(store.as_ref(), &report.object).await.unwrap();
    assert_eq!(manifest.node, "db-mysql-0");
    assert_eq!(manifest.raw_bytes, snapshot.len() as u64);
    assert_eq!(manifest.stored_bytes, stored.len() as u64);
    assert_eq!(manifest.sha256, hex::encode(Sha256::digest(&snapshot)));

    server.stop().await;
}

#[tokio::test]
async fn backup_to_explicit_object_uses_that_name() {
    let snapshot = snapshot_bytes("full-backuped", 7, 1_000);
    let server = TestServer::start("db-mysql-0", Arc::new(FakeProducer::new(snapshot))).await;
    let store = Arc::new(InMemory::new());
    let destination =
        StorageLocation::with_store(store.clone(), "adhoc/before-upgrade.xbackup.zst", "memory:///adhoc/before-upgrade.xbackup.zst");

    let report = BackupClient::new(&SidecarConfig::for_testing("db-mysql-1"))
        .unwrap()
        .take_backup(&server.host, &destination, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.object.as_ref(), "adhoc/before-upgrade.xbackup.zst");
    assert_eq!(object_count(&store).await, 2); // artifact + manifest

    server.stop().await;
}

#[tokio::test]
async fn backup_survives_manifest_write_failure() {
    let snapshot = snapshot_bytes("full-backuped", 11, 2_000);
    let server = TestServer::start("db-mysql-0", Arc::new(FakeProducer::new(snapshot.clone()))).await;
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("nightly.xbackup.zst");
    // A directory where the manifest should go makes its put fail.
    let blocker = dir.path().join("nightly.xbackup.zst.manifest.json");
    std::fs::create_dir(&blocker).unwrap();
    std::fs::write(blocker.join("keep"), b"x").unwrap();
    let destination = StorageLocation::parse(&format!("file://{}", artifact.display())).unwrap();

    let report = BackupClient::new(&SidecarConfig::for_testing("db-mysql-1"))
        .unwrap()
        .take_backup(&server.host, &destination, &CancellationToken::new())
        .await
        .expect("committed artifact is a successful backup");

    assert!(report.manifest.is_none());
    let stored = std::fs::read(&artifact).unwrap();
    assert_eq!(maybe_decompress(&stored).unwrap(), snapshot);

    server.stop().await;
}

#[tokio::test]
async fn backup_from_busy_node_is_a_lock_conflict() {
    let (producer, gate) = FakeProducer::held(snapshot_bytes("full-backuped", 42, 10_000));
    let server = TestServer::start("db-mysql-0", Arc::new(producer)).await;
    let config = SidecarConfig::for_testing("db-mysql-1");

    // Holds the server's lock until dropped.
    let first = peer_client(&config).open_backup(&server.host).await.unwrap();

    let (store, destination) = memory_bucket();
    let err = BackupClient::new(&config)
        .unwrap()
        .take_backup(&server.host, &destination, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SidecarError::LockConflict { .. }), "got {err:?}");
    assert_eq!(err.exit_code(), 1);
    assert_eq!(object_count(&store).await, 0);

    gate.notify_one();
    drop(first);
    server.stop().await;
}

#[tokio::test]
async fn backup_status_reports_identity() {
    let server = TestServer::start("db-mysql-0", Arc::new(FakeProducer::new(vec![1, 2, 3]))).await;

    let status = peer_client(&SidecarConfig::for_testing("db-mysql-1"))
        .status(&server.host)
        .await
        .unwrap();

    assert_eq!(status.node, "db-mysql-0");
    assert_eq!(status.ordinal, 0);
    assert_eq!(status.role, Role::Master);
    assert!(status.data_ready);
    assert!(!status.backup_in_progress);
    assert!(status.acceptable_donor(0));

    server.stop().await;
}

#[tokio::test]
async fn backup_with_credentials_round_trips() {
    let mut config = SidecarConfig::for_testing("db-mysql-0");
    config.backup.credentials = Some(Account::new("backup", "backup-pw"));
    let snapshot = snapshot_bytes("full-backuped", 9, 5_000);
    let server = TestServer::start_with(config.clone(), Arc::new(FakeProducer::new(snapshot))).await;

    // Without credentials the trigger is refused.
    let anonymous = SidecarConfig::for_testing("db-mysql-1");
    let err = match peer_client(&anonymous).open_backup(&server.host).await {
        Ok(_) => panic!("anonymous trigger was accepted"),
        Err(e) => e,
    };
    assert!(matches!(err, SidecarError::SourceUnavailable { .. }));

    let (store, destination) = memory_bucket();
    let mut authorised = SidecarConfig::for_testing("db-mysql-1");
    authorised.backup.credentials = config.backup.credentials.clone();
    BackupClient::new(&authorised)
        .unwrap()
        .take_backup(&server.host, &destination, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(object_count(&store).await, 2);

    server.stop().await;
}

// =============================================================================
// Clone Manager
// =============================================================================

#[tokio::test]
async fn clone_from_peer_populates_fresh_node() {
    let snapshot = snapshot_bytes("full-backuped", 1234, 200_000);
    let server = TestServer::start("db-mysql-0", Arc::new(FakeProducer::new(snapshot.clone()))).await;
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = Arc::new(DataDirectory::new(tmp.path().join("data")));
    let config = SidecarConfig::for_testing("db-mysql-1");

    let report = clone_manager(data_dir.clone(), &config)
        .clone(
            &BackupSource::Peer {
                host: server.host.clone(),
            },
            &CancellationToken::new(),
        )
        .await
        .expect("clone should succeed");

    assert_eq!(report.to_lsn, 1234);
    assert_eq!(report.artifact.as_deref(), Some("db-mysql-0"));
    assert!(data_dir.is_ready().await);
    assert!(data_dir.live_path().join(SYSTEM_SCHEMA_DIR).is_dir());
    let copied = std::fs::read(data_dir.live_path().join(PAYLOAD_FILE)).unwrap();
    assert_eq!(copied, payload_of(&snapshot));
    assert!(!data_dir.staging_path().exists());

    server.stop().await;
}

#[tokio::test]
async fn clone_from_bucket_picks_newest_artifact() {
    let (store, location) = memory_bucket();
    let old = snapshot_bytes("full-backuped", 100, 1_000);
    let new = snapshot_bytes("full-backuped", 200, 50_000);
    seed_bucket(&store, "db-20260101T000000Z", &old).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let newest = seed_bucket(&store, "db-20260102T000000Z", &new).await;

    let tmp = tempfile::tempdir().unwrap();
    let data_dir = Arc::new(DataDirectory::new(tmp.path().join("data")));
    let report = clone_manager(data_dir.clone(), &SidecarConfig::for_testing("db-mysql-0"))
        .clone(&BackupSource::Bucket { location }, &CancellationToken::new())
        .await
        .expect("clone should succeed");

    assert_eq!(report.to_lsn, 200);
    assert_eq!(report.artifact.as_deref(), Some(newest.as_ref()));
    let copied = std::fs::read(data_dir.live_path().join(PAYLOAD_FILE)).unwrap();
    assert_eq!(copied, payload_of(&new));
}

#[tokio::test]
async fn clone_into_empty_directory() {
    let (store, location) = memory_bucket();
    seed_bucket(&store, "db-20260101T000000Z", &snapshot_bytes("full-backuped", 5, 100)).await;

    let tmp = tempfile::tempdir().unwrap();
    let live = tmp.path().join("data");
    std::fs::create_dir(&live).unwrap();
    let data_dir = Arc::new(DataDirectory::new(&live));

    clone_manager(data_dir.clone(), &SidecarConfig::for_testing("db-mysql-0"))
        .clone(&BackupSource::Bucket { location }, &CancellationToken::new())
        .await
        .unwrap();

    assert!(data_dir.is_ready().await);
}

#[tokio::test]
async fn clone_into_fresh_volume_keeps_its_root() {
    use std::os::unix::fs::MetadataExt;

    let (store, location) = memory_bucket();
    let snapshot = snapshot_bytes("full-backuped", 6, 30_000);
    seed_bucket(&store, "db-20260101T000000Z", &snapshot).await;

    // What a freshly formatted volume looks like at its mount point.
    let tmp = tempfile::tempdir().unwrap();
    let live = tmp.path().join("data");
    std::fs::create_dir_all(live.join("lost+found")).unwrap();
    let root = std::fs::metadata(&live).unwrap().ino();
    let data_dir = Arc::new(DataDirectory::new(&live));
    assert!(data_dir.staging_path().starts_with(&live));

    clone_manager(data_dir.clone(), &SidecarConfig::for_testing("db-mysql-1"))
        .clone(&BackupSource::Bucket { location }, &CancellationToken::new())
        .await
        .expect("clone into a volume root should succeed");

    assert!(data_dir.is_ready().await);
    assert_eq!(std::fs::metadata(&live).unwrap().ino(), root);
    assert!(live.join("lost+found").is_dir());
    assert_eq!(std::fs::read(live.join(PAYLOAD_FILE)).unwrap(), payload_of(&snapshot));
    assert!(!data_dir.staging_path().exists());
}

// =============================================================================
// Bootstrap Controller
// =============================================================================

#[tokio::test]
async fn bootstrap_prefers_live_peer_over_bucket() {
    let snapshot = snapshot_bytes("full-backuped", 77, 10_000);
    let producer = Arc::new(FakeProducer::new(snapshot));
    let server = TestServer::start("db-mysql-0", producer.clone()).await;
    let (store, bucket) = memory_bucket();
    seed_bucket(&store, "db-20260101T000000Z", &snapshot_bytes("full-backuped", 1, 10)).await;

    let tmp = tempfile::tempdir().unwrap();
    let data_dir = Arc::new(DataDirectory::new(tmp.path().join("data")));
    let config = SidecarConfig::for_testing("db-mysql-2");
    let controller = BootstrapController::new(&config, data_dir.clone(), &fake_tools(producer.clone()))
        .unwrap()
        .with_candidates(vec![server.host.clone()])
        .with_bucket(Some(bucket))
        .with_probe_retry(RetryConfig::testing());

    match controller.bootstrap(&CancellationToken::new()).await.unwrap() {
        BootstrapOutcome::Cloned(report) => {
            assert!(report.source.starts_with("peer"), "cloned from {}", report.source);
            assert_eq!(report.to_lsn, 77);
        }
        other => panic!("expected a clone, got {other:?}"),
    }
    assert!(data_dir.is_ready().await);

    // A second run finds the data and leaves it alone.
    let outcome = controller.bootstrap(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, BootstrapOutcome::AlreadyInitialized));
    assert_eq!(producer.produced.load(std::sync::atomic::Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn bootstrap_falls_back_to_bucket_when_no_peer_answers() {
    let (store, bucket) = memory_bucket();
    let snapshot = snapshot_bytes("full-backuped", 31, 4_000);
    seed_bucket(&store, "db-20260101T000000Z", &snapshot).await;

    let tmp = tempfile::tempdir().unwrap();
    let data_dir = Arc::new(DataDirectory::new(tmp.path().join("data")));
    let mut config = SidecarConfig::for_testing("db-mysql-1");
    config.clone.discovery_timeout = "1500ms".into();
    let controller = BootstrapController::new(
        &config,
        data_dir.clone(),
        &fake_tools(Arc::new(FakeProducer::default())),
    )
    .unwrap()
    .with_candidates(vec!["127.0.0.1:1".to_string()])
    .with_bucket(Some(bucket))
    .with_probe_retry(RetryConfig::testing());

    match controller.bootstrap(&CancellationToken::new()).await.unwrap() {
        BootstrapOutcome::Cloned(report) => {
            assert!(report.source.starts_with("bucket"), "cloned from {}", report.source);
            assert_eq!(report.to_lsn, 31);
        }
        other => panic!("expected a clone, got {other:?}"),
    }
    assert_eq!(
        std::fs::read(data_dir.live_path().join(PAYLOAD_FILE)).unwrap(),
        payload_of(&snapshot)
    );
}

// =============================================================================
// Config Engine
// =============================================================================

#[tokio::test]
async fn configure_replica_points_at_master() {
    let conf = tempfile::tempdir().unwrap();
    let config = replica_config("db-mysql-2", conf.path());
    let engine = RecordingEngine::new();
    // Engine still starting for the first two attempts.
    engine.unavailable_for(2);

    let report = ConfigEngine::new(&config)
        .unwrap()
        .with_retry(RetryConfig::testing())
        .configure(&engine, &CancellationToken::new())
        .await
        .expect("configure should succeed once the engine is up");

    assert_eq!(report.role, Some(Role::Replica));
    assert!(report.source_changed);
    assert!(report.conf_written);

    let source = engine.source().await.unwrap();
    assert!(source.points_at("db-mysql-0", 3306));
    assert!(source.is_healthy());

    let statements = engine.statements().await;
    assert!(statements.contains(&"SET GLOBAL read_only = 1".to_string()));
    assert!(statements
        .iter()
        .any(|s| s.starts_with("CREATE USER IF NOT EXISTS 'exporter'@'%'") && s.ends_with("MAX_USER_CONNECTIONS 3")));

    let fragment = std::fs::read_to_string(conf.path().join(DYNAMIC_CONF_FILE)).unwrap();
    assert!(fragment.contains("server-id = 102"));
    assert!(fragment.contains("report-host = db-mysql-2"));
}

#[tokio::test]
async fn configure_is_idempotent() {
    let conf = tempfile::tempdir().unwrap();
    let config = replica_config("db-mysql-1", conf.path());
    let engine = RecordingEngine::new();
    let config_engine = ConfigEngine::new(&config).unwrap().with_retry(RetryConfig::testing());
    let cancel = CancellationToken::new();

    config_engine.configure(&engine, &cancel).await.unwrap();
    engine.clear().await;

    let second = config_engine.configure(&engine, &cancel).await.unwrap();
    assert_eq!(second.replication_statements, 0);
    assert!(!second.source_changed);
    assert!(!second.conf_written);
    assert!(engine.replication_restarts().await.is_empty());
}

#[tokio::test]
async fn configure_master_never_replicates() {
    let conf = tempfile::tempdir().unwrap();
    let config = replica_config("db-mysql-0", conf.path());
    let engine = RecordingEngine::new();

    let report = ConfigEngine::new(&config)
        .unwrap()
        .with_retry(RetryConfig::testing())
        .configure(&engine, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.role, Some(Role::Master));
    assert_eq!(report.replication_statements, 0);
    assert!(engine.replication_restarts().await.is_empty());
    assert!(engine
        .statements()
        .await
        .contains(&"SET GLOBAL read_only = 0".to_string()));
}

#[tokio::test]
async fn configure_restarts_stopped_threads_without_repointing() {
    let conf = tempfile::tempdir().unwrap();
    let config = replica_config("db-mysql-3", conf.path());
    let engine = RecordingEngine::new();
    engine
        .set_source(Some(ReplicationSource {
            host: "db-mysql-0".into(),
            port: 3306,
            io_running: false,
            sql_running: false,
            seconds_behind: None,
        }))
        .await;

    let report = ConfigEngine::new(&config)
        .unwrap()
        .with_retry(RetryConfig::testing())
        .configure(&engine, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.source_changed);
    assert_eq!(engine.replication_restarts().await, vec!["START SLAVE".to_string()]);
}

#[tokio::test]
async fn configure_master_with_upstream_is_a_topology_conflict() {
    let conf = tempfile::tempdir().unwrap();
    let config = replica_config("db-mysql-0", conf.path());
    let engine = RecordingEngine::new();
    engine
        .set_source(Some(ReplicationSource {
            host: "db-mysql-1".into(),
            port: 3306,
            io_running: true,
            sql_running: true,
            seconds_behind: Some(0),
        }))
        .await;

    let err = ConfigEngine::new(&config)
        .unwrap()
        .with_retry(RetryConfig::testing())
        .configure(&engine, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SidecarError::TopologyConflict(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 1);
}

// =============================================================================
// Real engine
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn engine_configure_master_against_mysql() {
    let docker = Cli::default();
    let container = mysql_container(&docker);
    let engine = MySqlEngine::new(mysql_url(&container));

    let conf = tempfile::tempdir().unwrap();
    let mut config = replica_config("db-mysql-0", conf.path());
    config.accounts.admin = Some(Account::new("orchestrator", "orc-pw"));
    let config_engine = ConfigEngine::new(&config).unwrap();
    let cancel = CancellationToken::new();

    let first = config_engine.configure(&engine, &cancel).await.expect("first pass");
    assert_eq!(first.role, Some(Role::Master));

    let second = config_engine.configure(&engine, &cancel).await.expect("second pass");
    assert_eq!(second.replication_statements, 0);
    assert!(!second.conf_written);

    assert_eq!(engine.replication_source().await.unwrap(), None);
}

#[tokio::test]
async fn engine_unreachable_is_retryable() {
    let engine = MySqlEngine::new("mysql://root@127.0.0.1:1")
        .with_connect_timeout(std::time::Duration::from_secs(2));
    let err = engine.execute("SELECT 1").await.unwrap_err();
    let err: SidecarError = err.into();
    assert!(err.is_retryable(), "got {err:?}");
}
