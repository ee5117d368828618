// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sidecar.
//!
//! Errors are categorized by the lifecycle step that produced them (clone,
//! configure, backup) and carry enough context to be logged once and acted on
//! by the CLI.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `ConfigInvalid` | No | Configuration invalid or incomplete |
//! | `SourceUnavailable` | No | Clone source unreachable or refused the request |
//! | `StreamInterrupted` | No | Snapshot stream ended early or was cancelled |
//! | `VerificationFailed` | No | Staged snapshot failed consistency checks |
//! | `EngineUnavailable` | Yes | Database engine not accepting connections yet |
//! | `EngineRejected` | No | Engine refused an administrative statement |
//! | `TopologyConflict` | No | Engine reports a topology that contradicts our role |
//! | `LockConflict` | No | Source node already producing a backup |
//! | `UploadAborted` | No | Backup upload aborted at a known stage |
//! | `Storage` | No | Object storage error |
//! | `Io` | No | Local filesystem / subprocess IO error |
//! | `Clone` | No | Wraps any failure on the clone path (exit code 8) |
//! | `InvalidState` | No | Data directory state machine violation |
//! | `Shutdown` | No | Cancellation requested |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Only [`SidecarError::EngineUnavailable`] is retried, with bounded backoff
//! (see [`crate::resilience::retry_with_backoff`]). Clone failures are never
//! retried in-process: the orchestrator restarts the pod.

use std::fmt;
use thiserror::Error;

/// Result type alias for sidecar operations.
pub type Result<T> = std::result::Result<T, SidecarError>;

/// Exit code for a failed clone during `clone-and-init`.
pub const EXIT_CLONE_FAILED: i32 = 8;

/// Exit code for every other fatal failure.
pub const EXIT_FAILURE: i32 = 1;

/// Where a backup upload was when it aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    /// Could not reach the source or it refused the request.
    SourceConnection,
    /// The source stream broke after bytes started flowing.
    MidStream,
    /// The destination refused a write or the final commit.
    DestinationWrite,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceConnection => write!(f, "source-connection"),
            Self::MidStream => write!(f, "mid-stream"),
            Self::DestinationWrite => write!(f, "destination-write"),
        }
    }
}

/// Errors that can occur in the sidecar.
#[derive(Error, Debug)]
pub enum SidecarError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    /// A clone source could not be reached or refused to serve.
    #[error("Source unavailable ({source_name}): {message}")]
    SourceUnavailable { source_name: String, message: String },

    /// The snapshot stream ended before completion.
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// The staged snapshot is not a consistent full backup.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// The database engine is not reachable (yet).
    ///
    /// Retryable: the engine is usually still starting.
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The database engine rejected a statement.
    #[error("Engine rejected statement ({statement}): {message}")]
    EngineRejected { statement: String, message: String },

    /// The engine's replication state contradicts this node's role.
    #[error("Topology conflict: {0}")]
    TopologyConflict(String),

    /// The source node is already producing a backup.
    #[error("Backup already in progress on {node}")]
    LockConflict { node: String },

    /// Backup upload aborted; the destination was left untouched.
    #[error("Upload aborted at {stage}: {message}")]
    UploadAborted { stage: BackupStage, message: String },

    /// Object storage failure.
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),

    /// Local IO failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any failure on the clone path.
    #[error("Clone failed: {0}")]
    Clone(Box<SidecarError>),

    /// State machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Cancellation requested.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SidecarError {
    /// Create a source-unavailable error.
    pub fn source_unavailable(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create an upload-aborted error.
    pub fn upload_aborted(stage: BackupStage, message: impl Into<String>) -> Self {
        Self::UploadAborted {
            stage,
            message: message.into(),
        }
    }

    /// Wrap as a clone-path failure. Already-wrapped errors are left alone.
    pub fn into_clone_failure(self) -> Self {
        match self {
            Self::Clone(_) => self,
            other => Self::Clone(Box::new(other)),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::EngineUnavailable(_) => true,
            Self::ConfigInvalid(_) => false,
            Self::SourceUnavailable { .. } => false,
            Self::StreamInterrupted(_) => false,
            Self::VerificationFailed(_) => false,
            Self::EngineRejected { .. } => false,
            Self::TopologyConflict(_) => false, // Needs operator attention
            Self::LockConflict { .. } => false,
            Self::UploadAborted { .. } => false,
            Self::Storage(_) => false,
            Self::Io(_) => false,
            Self::Clone(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// The error kind with any clone wrapper removed.
    pub fn root(&self) -> &SidecarError {
        match self {
            Self::Clone(inner) => inner.root(),
            other => other,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Clone(_) => EXIT_CLONE_FAILED,
            _ => EXIT_FAILURE,
        }
    }
}
