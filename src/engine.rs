// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database engine administration.
//!
//! The sidecar never speaks to the engine except through [`AdminEngine`]: run
//! one administrative statement, and read the current replication source.
//! [`MySqlEngine`] implements it over a one-connection sqlx pool to the local
//! instance; tests substitute a recording fake.
//!
//! # Example
//!
//! ```rust,no_run
//! use mysql_sidecar::engine::{AdminEngine, BoxFuture, ReplicationSource};
//!
//! struct Quiet;
//!
//! impl AdminEngine for Quiet {
//!     fn execute<'a>(&'a self, _statement: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn replication_source(&self) -> BoxFuture<'_, Option<ReplicationSource>> {
//!         Box::pin(async { Ok(None) })
//!     }
//! }
//! ```

use crate::error::SidecarError;
use sqlx::mysql::{MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Executor, Row};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'a>>;

/// Failure talking to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Connection refused / dropped / engine still starting.
    Unavailable(String),
    /// The engine answered and refused the statement.
    Rejected { statement: String, message: String },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Unavailable(msg) => write!(f, "engine unavailable: {}", msg),
            EngineError::Rejected { statement, message } => {
                write!(f, "engine rejected '{}': {}", statement, message)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<EngineError> for SidecarError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Unavailable(msg) => SidecarError::EngineUnavailable(msg),
            EngineError::Rejected { statement, message } => {
                SidecarError::EngineRejected { statement, message }
            }
        }
    }
}

/// The upstream this engine currently replicates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSource {
    pub host: String,
    pub port: u16,
    pub io_running: bool,
    pub sql_running: bool,
    /// `None` when the engine cannot compute lag (threads stopped).
    pub seconds_behind: Option<u64>,
}

impl ReplicationSource {
    /// Whether this points at `host:port`.
    pub fn points_at(&self, host: &str, port: u16) -> bool {
        self.host.eq_ignore_ascii_case(host) && self.port == port
    }

    /// Both replication threads running.
    pub fn is_healthy(&self) -> bool {
        self.io_running && self.sql_running
    }
}

/// What the sidecar needs from the database engine.
pub trait AdminEngine: Send + Sync + 'static {
    /// Execute one administrative statement in the admin session.
    ///
    /// Session settings (`SET @@SESSION...`) persist for subsequent calls
    /// until the connection is lost; callers re-issue them on retry.
    fn execute<'a>(&'a self, statement: &'a str) -> BoxFuture<'a, ()>;

    /// Current replication source, `None` if none is configured.
    fn replication_source(&self) -> BoxFuture<'_, Option<ReplicationSource>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MySQL implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// Client-side and server-side error numbers meaning "not reachable (yet)".
///
/// 1040 too many connections, 1053 server shutdown, 2002/2003 can't connect,
/// 2006 gone away, 2013 lost connection.
const TRANSIENT_ERROR_NUMBERS: &[u16] = &[1040, 1053, 2002, 2003, 2006, 2013];

fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err
            .try_downcast_ref::<MySqlDatabaseError>()
            .map(|e| TRANSIENT_ERROR_NUMBERS.contains(&e.number()))
            .unwrap_or(false),
        _ => false,
    }
}

fn classify(statement: &str, e: sqlx::Error) -> EngineError {
    if is_transient(&e) {
        EngineError::Unavailable(e.to_string())
    } else {
        EngineError::Rejected {
            statement: redact(statement),
            message: e.to_string(),
        }
    }
}

/// Strip quoted literals (passwords) before a statement reaches logs.
pub fn redact(statement: &str) -> String {
    let mut out = String::with_capacity(statement.len());
    let mut in_quote = false;
    for ch in statement.chars() {
        if ch == '\'' {
            if !in_quote {
                out.push_str("'***");
            } else {
                out.push('\'');
            }
            in_quote = !in_quote;
        } else if !in_quote {
            out.push(ch);
        }
    }
    out
}

/// Session setting applied to every admin connection, so account changes
/// never reach the binary log.
pub const DISABLE_BINLOG: &str = "SET @@SESSION.SQL_LOG_BIN = 0";

/// [`AdminEngine`] over a one-connection sqlx pool to the local instance.
///
/// The pool is built on first use. A connection the server drops is replaced
/// on the next call, and the replacement gets [`DISABLE_BINLOG`] too.
pub struct MySqlEngine {
    url: String,
    connect_timeout: Duration,
    pool: OnceCell<MySqlPool>,
}

impl MySqlEngine {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            pool: OnceCell::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn pool(&self) -> EngineResult<&MySqlPool> {
        self.pool
            .get_or_try_init(|| async {
                MySqlPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(self.connect_timeout)
                    .after_connect(|conn, _meta| {
                        Box::pin(async move {
                            conn.execute(DISABLE_BINLOG).await?;
                            debug!("Admin connection established");
                            Ok(())
                        })
                    })
                    .connect_lazy(&self.url)
                    .map_err(|e| EngineError::Rejected {
                        statement: "CONNECT".into(),
                        message: e.to_string(),
                    })
            })
            .await
    }
}

impl AdminEngine for MySqlEngine {
    fn execute<'a>(&'a self, statement: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            match sqlx::raw_sql(statement).execute(pool).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    let err = classify(statement, e);
                    if matches!(err, EngineError::Unavailable(_)) {
                        warn!(error = %err, "Admin statement failed, engine unreachable");
                    }
                    Err(err)
                }
            }
        })
    }

    fn replication_source(&self) -> BoxFuture<'_, Option<ReplicationSource>> {
        Box::pin(async move {
            const STATEMENT: &str = "SHOW SLAVE STATUS";
            let pool = self.pool().await?;
            let row = pool
                .fetch_optional(sqlx::raw_sql(STATEMENT))
                .await
                .map_err(|e| classify(STATEMENT, e))?;
            Ok(row.as_ref().and_then(source_from_row))
        })
    }
}

/// Column as text, whatever integer/string type the server chose.
fn column_text(row: &MySqlRow, name: &str) -> Option<String> {
    if let Ok(v) = row.try_get::<Option<String>, _>(name) {
        return v;
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(name) {
        return v.map(|n| n.to_string());
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(name) {
        return v.map(|n| n.to_string());
    }
    row.try_get::<Option<Vec<u8>>, _>(name)
        .ok()
        .flatten()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn source_from_row(row: &MySqlRow) -> Option<ReplicationSource> {
    let host = column_text(row, "Master_Host")?;
    if host.is_empty() {
        return None;
    }
    let port = column_text(row, "Master_Port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(3306);
    let yes = |col: &str| {
        column_text(row, col)
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    };
    Some(ReplicationSource {
        host,
        port,
        io_running: yes("Slave_IO_Running"),
        sql_running: yes("Slave_SQL_Running"),
        seconds_behind: column_text(row, "Seconds_Behind_Master").and_then(|s| s.parse().ok()),
    })
}

/// Engine that accepts everything and has no upstream. Logs what it would do.
#[derive(Clone, Default)]
pub struct NoOpEngine;

impl AdminEngine for NoOpEngine {
    fn execute<'a>(&'a self, statement: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(statement = %redact(statement), "NoOp: would execute");
            Ok(())
        })
    }

    fn replication_source(&self) -> BoxFuture<'_, Option<ReplicationSource>> {
        Box::pin(async { Ok(None) })
    }
}
