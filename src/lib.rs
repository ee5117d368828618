//! # MySQL Sidecar
//!
//! A per-node helper for a clustered MySQL deployment. It runs next to every
//! engine instance and handles three lifecycle duties:
//!
//! 1. **Clone**: populate an empty data directory from a live peer or from a
//!    snapshot in object storage.
//! 2. **Configure**: idempotently bring accounts and replication topology into
//!    their desired state.
//! 3. **Backup**: serve full snapshots over HTTP, and pull them from a peer
//!    into object storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              mysql-sidecar                               │
//! │                                                                          │
//! │  clone-and-init                run                   take-backup-to      │
//! │  ┌─────────────────────┐      ┌──────────────┐      ┌────────────────┐   │
//! │  │ BootstrapController │      │ ConfigEngine │      │ BackupClient   │   │
//! │  │  └► CloneManager    │      │      ▼       │      │ peer ► bucket  │   │
//! │  └─────────────────────┘      │ BackupServer │      └────────────────┘   │
//! │            │                  └──────────────┘               │           │
//! │            ▼                         │                       ▼           │
//! │     DataDirectory            AdminEngine (sqlx)       ObjectStore        │
//! │  (staging → rename)          BackupProducer           (multipart)        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every copy path runs through [`stream::Pump`] with a fixed buffer, so
//! memory stays flat whatever the snapshot size.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mysql_sidecar::{cli, SidecarConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SidecarConfig::load(None).expect("invalid config");
//!     let cancel = CancellationToken::new();
//!
//!     if let Err(e) = cli::run(&config, cancel).await {
//!         std::process::exit(e.exit_code());
//!     }
//! }
//! ```

pub mod bootstrap;
pub mod cli;
pub mod client;
pub mod clone;
pub mod config;
pub mod configure;
pub mod datadir;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod resilience;
pub mod server;
pub mod storage;
pub mod stream;
pub mod tools;
pub mod topology;

// Re-exports for convenience
pub use bootstrap::{BootstrapController, BootstrapOutcome};
pub use client::{BackupClient, BackupReport};
pub use clone::{BackupSource, CloneManager, CloneReport};
pub use config::{Account, SidecarConfig};
pub use configure::{ConfigEngine, ConfigureReport};
pub use datadir::{DataDirectory, DataState};
pub use engine::{AdminEngine, MySqlEngine, NoOpEngine, ReplicationSource};
pub use error::{BackupStage, Result, SidecarError};
pub use server::BackupServer;
pub use storage::StorageLocation;
pub use tools::{BackupProducer, SnapshotExtractor, SnapshotPreparer, Toolset};
pub use topology::{NodeIdentity, ReplicationTopology, Role};
