//! Backup Server wire types and per-request state.
//!
//! # Request State Transitions
//!
//! ```text
//!            try_acquire ok          producer started
//! request ─────────────────→ Locked ───────────────────→ Streaming
//!   │                          │                          │      │
//!   │ lock busy                │ spawn failed   producer ok      producer failed /
//!   ↓                          ↓                          ↓      ↓ client gone
//! Rejected (409)             Failed                      Done   Failed
//! ```
//!
//! The lock is held from `Locked` until the request reaches `Done` or
//! `Failed`.

use crate::topology::Role;
use serde::{Deserialize, Serialize};

/// Response header naming the node that produced the artifact.
pub const HEADER_BACKUP_NODE: &str = "x-backup-node";

/// Response header with the RFC 3339 production start time.
pub const HEADER_BACKUP_STARTED_AT: &str = "x-backup-started-at";

/// Status probe path.
pub const STATUS_PATH: &str = "/status";

/// Liveness probe path.
pub const HEALTH_PATH: &str = "/health";

/// Phase of one backup request.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    /// Lock acquired, producer not yet streaming.
    Locked,
    Streaming,
    Done,
    Failed,
    /// Lock was busy.
    Rejected,
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupPhase::Locked => write!(f, "Locked"),
            BackupPhase::Streaming => write!(f, "Streaming"),
            BackupPhase::Done => write!(f, "Done"),
            BackupPhase::Failed => write!(f, "Failed"),
            BackupPhase::Rejected => write!(f, "Rejected"),
        }
    }
}

/// Body of `GET /status`, used by joining nodes to pick a donor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    pub ordinal: u32,
    pub role: Role,
    /// Live data directory holds an initialised database.
    pub data_ready: bool,
    /// Replica lag as reported by the engine; `None` for a master or when
    /// replication is not running.
    pub replication_lag_secs: Option<u64>,
    pub backup_in_progress: bool,
}

impl NodeStatus {
    /// Whether this node can donate a snapshot given a lag ceiling.
    pub fn acceptable_donor(&self, max_lag_secs: u64) -> bool {
        if !self.data_ready {
            return false;
        }
        match self.role {
            Role::Master => true,
            Role::Replica => matches!(self.replication_lag_secs, Some(lag) if lag <= max_lag_secs),
        }
    }
}
