//! Configuration for the sidecar.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then the environment injected by the cluster controller (pod identity and
//! credentials). The result is validated once, up front, so later components
//! can rely on it.
//!
//! # Quick Start
//!
//! ```rust
//! use mysql_sidecar::config::SidecarConfig;
//!
//! let config = SidecarConfig::for_testing("db-mysql-1");
//! assert_eq!(config.node.hostname, "db-mysql-1");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SidecarConfig
//! ├── node: NodeConfig          # hostname, cluster, service, namespace
//! ├── paths: PathsConfig        # live data directory, dynamic conf dir
//! ├── engine: EngineConfig      # admin connection URL, MySQL port
//! ├── accounts: AccountsConfig  # replication / admin / metrics users
//! ├── backup: BackupConfig      # HTTP endpoint, lock, streaming buffer
//! ├── clone: CloneConfig        # discovery, lag threshold, bucket URI
//! └── tools: ToolsConfig        # xtrabackup / xbstream binaries
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node:
//!   hostname: "db-mysql-1"
//!   cluster_name: "db"
//!   service_name: "db-mysql-nodes"
//!   namespace: "default"
//!
//! backup:
//!   port: 8080
//!   drain_timeout: "30s"
//!
//! clone:
//!   discovery_timeout: "20s"
//!   max_replication_lag: "5m"
//!   init_bucket_uri: "s3://backups/db/"
//! ```

use crate::error::{Result, SidecarError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object shared by every subcommand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SidecarConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub clone: CloneConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl SidecarConfig {
    /// Load defaults, overlay the optional YAML file, then the process
    /// environment, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SidecarError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse YAML text.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| SidecarError::ConfigInvalid(format!("invalid YAML: {e}")))
    }

    /// Overlay environment variables.
    ///
    /// `lookup` is injected so tests don't have to mutate the process env.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("MY_POD_NAME").or_else(|| get("HOSTNAME")) {
            self.node.hostname = v;
        }
        if let Some(v) = get("MY_CLUSTER_NAME") {
            self.node.cluster_name = v;
        }
        if let Some(v) = get("MY_NAMESPACE") {
            self.node.namespace = Some(v);
        }
        if let Some(v) = get("MY_SERVICE_NAME") {
            self.node.service_name = Some(v);
        }
        if let Some(v) = get("MY_SERVER_ID_OFFSET").and_then(|v| v.parse().ok()) {
            self.node.server_id_offset = v;
        }
        if let Some(v) = get("INIT_BUCKET_URI") {
            self.clone.init_bucket_uri = Some(v);
        }
        if let Some(v) = get("MYSQL_ADMIN_URL") {
            self.engine.admin_url = v;
        }

        let account = |user_key: &str, password_key: &str| -> Option<Account> {
            get(user_key).map(|user| Account {
                user,
                password: get(password_key).unwrap_or_default(),
            })
        };
        if let Some(a) = account("MYSQL_REPLICATION_USER", "MYSQL_REPLICATION_PASSWORD") {
            self.accounts.replication = Some(a);
        }
        if let Some(a) = account("MYSQL_ORC_TOPOLOGY_USER", "MYSQL_ORC_TOPOLOGY_PASSWORD") {
            self.accounts.admin = Some(a);
        }
        if let Some(a) = account("MYSQL_METRICS_EXPORTER_USER", "MYSQL_METRICS_EXPORTER_PASSWORD") {
            self.accounts.metrics = Some(a);
        }
        if let Some(a) = account("BACKUP_USER", "BACKUP_PASSWORD") {
            self.backup.credentials = Some(a);
        }
    }

    /// Reject configurations no component could work with.
    pub fn validate(&self) -> Result<()> {
        if self.node.hostname.trim().is_empty() {
            return Err(SidecarError::ConfigInvalid(
                "node.hostname is empty (set MY_POD_NAME or HOSTNAME)".into(),
            ));
        }
        if self.node.cluster_name.trim().is_empty() {
            return Err(SidecarError::ConfigInvalid("node.cluster_name is empty".into()));
        }
        if !self.backup.endpoint.starts_with('/') {
            return Err(SidecarError::ConfigInvalid(format!(
                "backup.endpoint must start with '/': {}",
                self.backup.endpoint
            )));
        }
        if self.backup.stream_buffer_size == 0 {
            return Err(SidecarError::ConfigInvalid("backup.stream_buffer_size must be > 0".into()));
        }
        for (name, value) in [
            ("backup.drain_timeout", &self.backup.drain_timeout),
            ("clone.discovery_timeout", &self.clone.discovery_timeout),
            ("clone.max_replication_lag", &self.clone.max_replication_lag),
            ("clone.peer_request_timeout", &self.clone.peer_request_timeout),
        ] {
            humantime::parse_duration(value)
                .map_err(|e| SidecarError::ConfigInvalid(format!("{name} '{value}': {e}")))?;
        }
        for (name, account) in [
            ("replication", &self.accounts.replication),
            ("admin", &self.accounts.admin),
            ("metrics", &self.accounts.metrics),
        ] {
            if let Some(account) = account {
                account.validate(name)?;
            }
        }
        Ok(())
    }

    /// Create a minimal config for testing.
    pub fn for_testing(hostname: &str) -> Self {
        let mut config = Self::default();
        config.node.hostname = hostname.to_string();
        config.node.cluster_name = "db".to_string();
        config.backup.drain_timeout = "2s".to_string();
        config.clone.discovery_timeout = "2s".to_string();
        config.clone.peer_request_timeout = "1s".to_string();
        config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig: who we are within the cluster
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity inputs. The ordinal is parsed from `hostname`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Pod hostname, e.g. `db-mysql-2`.
    #[serde(default)]
    pub hostname: String,

    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Governing headless service; part of the node FQDN.
    #[serde(default)]
    pub service_name: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    /// `server_id = server_id_offset + ordinal`.
    #[serde(default = "default_server_id_offset")]
    pub server_id_offset: u32,
}

fn default_cluster_name() -> String {
    "mysql".to_string()
}

fn default_server_id_offset() -> u32 {
    100
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            cluster_name: default_cluster_name(),
            service_name: None,
            namespace: None,
            server_id_offset: default_server_id_offset(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PathsConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Live data directory the engine runs on.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for the generated server config fragment.
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/mysql")
}

fn default_conf_dir() -> PathBuf {
    PathBuf::from("/etc/mysql/conf.d")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            conf_dir: default_conf_dir(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EngineConfig: local admin connection
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// sqlx connection URL for the local admin session.
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Port replicas use to reach the master's engine.
    #[serde(default = "default_mysql_port")]
    pub mysql_port: u16,
}

fn default_admin_url() -> String {
    "mysql://root@127.0.0.1:3306".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            mysql_port: default_mysql_port(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Accounts
// ═══════════════════════════════════════════════════════════════════════════════

/// A user/password pair supplied from outside. Never generated here.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Account {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    fn validate(&self, role: &str) -> Result<()> {
        // Quoting rules for account names are simpler than escaping them.
        let bad = |s: &str| s.contains('\'') || s.contains('\\');
        if self.user.is_empty() || bad(&self.user) {
            return Err(SidecarError::ConfigInvalid(format!("invalid {role} user name")));
        }
        if bad(&self.password) {
            return Err(SidecarError::ConfigInvalid(format!(
                "{role} password contains quote or backslash"
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountsConfig {
    /// Used by replicas to pull binlogs from the master.
    #[serde(default)]
    pub replication: Option<Account>,

    /// Topology manager / orchestrator account.
    #[serde(default)]
    pub admin: Option<Account>,

    /// Metrics exporter account.
    #[serde(default)]
    pub metrics: Option<Account>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackupConfig: Backup Server and streaming
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Port the Backup Server listens on; peers are assumed to use the same.
    #[serde(default = "default_backup_port")]
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Path that triggers a backup stream.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Basic-auth credentials. When set, the server requires them and the
    /// clients send them.
    #[serde(default)]
    pub credentials: Option<Account>,

    /// How long in-flight streams may run after cancellation.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    /// Fixed buffer for every streaming copy.
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,

    /// zstd level for artifacts written to buckets.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Multipart parts allowed in flight during upload.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

fn default_backup_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_endpoint() -> String {
    "/xbackup".to_string()
}

fn default_drain_timeout() -> String {
    "30s".to_string()
}

fn default_stream_buffer_size() -> usize {
    64 * 1024
}

fn default_compression_level() -> i32 {
    3
}

fn default_upload_concurrency() -> usize {
    4
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            port: default_backup_port(),
            bind_address: default_bind_address(),
            endpoint: default_endpoint(),
            credentials: None,
            drain_timeout: default_drain_timeout(),
            stream_buffer_size: default_stream_buffer_size(),
            compression_level: default_compression_level(),
            upload_concurrency: default_upload_concurrency(),
        }
    }
}

impl BackupConfig {
    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CloneConfig: source discovery
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Bucket location of cluster snapshots, e.g. `s3://backups/db/`.
    #[serde(default)]
    pub init_bucket_uri: Option<String>,

    /// Total time budget for probing peers.
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout: String,

    /// Peers lagging more than this are not used as donors.
    #[serde(default = "default_max_replication_lag")]
    pub max_replication_lag: String,

    /// Per-request connect/status timeout for peers.
    #[serde(default = "default_peer_request_timeout")]
    pub peer_request_timeout: String,

    /// Run `xtrabackup --prepare` on the staged snapshot before promotion.
    #[serde(default = "default_true")]
    pub prepare: bool,

    /// Ranged re-reads allowed when a bucket download breaks.
    #[serde(default = "default_download_resume_attempts")]
    pub download_resume_attempts: u32,
}

fn default_discovery_timeout() -> String {
    "30s".to_string()
}

fn default_max_replication_lag() -> String {
    "5m".to_string()
}

fn default_peer_request_timeout() -> String {
    "10s".to_string()
}

fn default_true() -> bool {
    true
}

fn default_download_resume_attempts() -> u32 {
    3
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            init_bucket_uri: None,
            discovery_timeout: default_discovery_timeout(),
            max_replication_lag: default_max_replication_lag(),
            peer_request_timeout: default_peer_request_timeout(),
            prepare: true,
            download_resume_attempts: default_download_resume_attempts(),
        }
    }
}

impl CloneConfig {
    pub fn discovery_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.discovery_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn max_replication_lag_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_replication_lag).unwrap_or(Duration::from_secs(300))
    }

    pub fn peer_request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.peer_request_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ToolsConfig: external binaries
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_xtrabackup")]
    pub xtrabackup: String,

    #[serde(default = "default_xbstream")]
    pub xbstream: String,

    /// Extra arguments appended to `xtrabackup --backup`.
    #[serde(default)]
    pub backup_args: Vec<String>,
}

fn default_xtrabackup() -> String {
    "xtrabackup".to_string()
}

fn default_xbstream() -> String {
    "xbstream".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            xtrabackup: default_xtrabackup(),
            xbstream: default_xbstream(),
            backup_args: Vec::new(),
        }
    }
}
