// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Config Engine: bring the local engine into its desired state.
//!
//! Safe to run on every process start. Each pass:
//!
//! 1. Writes `<conf_dir>/10-dynamic.cnf` (server id, report host) if it changed.
//! 2. Disables binary logging for the admin session so account changes stay
//!    local to this node.
//! 3. Creates and grants every configured account. `CREATE USER IF NOT EXISTS`
//!    and `GRANT` are idempotent, so nothing is checked first.
//! 4. Sets `read_only` from the node's role.
//! 5. Replicas: points replication at the master, but only if the engine's
//!    current source differs. Re-pointing discards relay progress.
//!
//! Steps 2-5 are retried as one unit while the engine is unavailable (it is
//! usually still starting).

use crate::config::{Account, AccountsConfig, SidecarConfig};
use crate::engine::{redact, AdminEngine, ReplicationSource, DISABLE_BINLOG};
use crate::error::{Result, SidecarError};
use crate::metrics;
use crate::resilience::{retry_with_backoff, RetryConfig};
use crate::topology::{NodeIdentity, ReplicationTopology, Role};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the generated server config fragment.
pub const DYNAMIC_CONF_FILE: &str = "10-dynamic.cnf";

const REPLICATION_GRANTS: &str = "REPLICATION SLAVE, REPLICATION CLIENT";
const ADMIN_GRANTS: &str = "SUPER, PROCESS, RELOAD, REPLICATION CLIENT, REPLICATION SLAVE";
const METRICS_GRANTS: &str = "SELECT, PROCESS, REPLICATION CLIENT";
const METRICS_MAX_CONNECTIONS: u32 = 3;

/// What one configure pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureReport {
    pub role: Option<Role>,
    /// The config fragment was (re)written.
    pub conf_written: bool,
    /// Statements issued on the successful attempt.
    pub statements: usize,
    /// Replication statements among them (`STOP`/`CHANGE`/`START SLAVE`).
    pub replication_statements: usize,
    /// Replication was re-pointed at a new source.
    pub source_changed: bool,
}

pub struct ConfigEngine {
    identity: NodeIdentity,
    accounts: AccountsConfig,
    mysql_port: u16,
    conf_dir: PathBuf,
    retry: RetryConfig,
}

impl ConfigEngine {
    pub fn new(config: &SidecarConfig) -> Result<Self> {
        Ok(Self {
            identity: NodeIdentity::from_config(&config.node)?,
            accounts: config.accounts.clone(),
            mysql_port: config.engine.mysql_port,
            conf_dir: config.paths.conf_dir.clone(),
            retry: RetryConfig::engine(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Full pass: config fragment, then engine state.
    pub async fn configure(
        &self,
        engine: &dyn AdminEngine,
        cancel: &CancellationToken,
    ) -> Result<ConfigureReport> {
        let result = self.configure_inner(engine, cancel).await;
        match &result {
            Ok(report) => {
                metrics::record_configure(true, report.statements);
                info!(
                    node = %self.identity.hostname,
                    role = %self.identity.role(),
                    statements = report.statements,
                    source_changed = report.source_changed,
                    conf_written = report.conf_written,
                    "Configuration applied"
                );
            }
            Err(e) => {
                metrics::record_configure(false, 0);
                error!(node = %self.identity.hostname, error = %e, "Configuration failed");
            }
        }
        result
    }

    async fn configure_inner(
        &self,
        engine: &dyn AdminEngine,
        cancel: &CancellationToken,
    ) -> Result<ConfigureReport> {
        let topology = ReplicationTopology::for_node(&self.identity);
        topology.validate()?;
        let desired_master = match topology.master_of(self.identity.ordinal) {
            Some(master) => {
                let account = self.accounts.replication.as_ref().ok_or_else(|| {
                    SidecarError::ConfigInvalid("replica requires accounts.replication".into())
                })?;
                Some((self.identity.peer_fqdn(master), account))
            }
            None => None,
        };

        let conf_written = self.write_server_conf().await?;

        let mut report = retry_with_backoff("configure", &self.retry, cancel, || {
            self.apply(engine, desired_master.as_ref().map(|(h, a)| (h.as_str(), *a)))
        })
        .await?;
        report.conf_written = conf_written;
        Ok(report)
    }

    /// Write the server config fragment if its content differs. Returns
    /// whether the file was written.
    pub async fn write_server_conf(&self) -> Result<bool> {
        let path = self.conf_dir.join(DYNAMIC_CONF_FILE);
        let desired = render_server_conf(&self.identity);
        match tokio::fs::read_to_string(&path).await {
            Ok(current) if current == desired => {
                debug!(path = %path.display(), "Server config fragment up to date");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tokio::fs::create_dir_all(&self.conf_dir).await?;
        write_replace(&path, desired.as_bytes()).await?;
        info!(path = %path.display(), server_id = self.identity.server_id, "Wrote server config fragment");
        Ok(true)
    }

    /// One attempt at steps 2-5. Every step is idempotent, so a retry after a
    /// partial attempt starts again from the top.
    async fn apply(
        &self,
        engine: &dyn AdminEngine,
        desired_master: Option<(&str, &Account)>,
    ) -> Result<ConfigureReport> {
        let mut report = ConfigureReport {
            role: Some(self.identity.role()),
            ..Default::default()
        };
        let run = |statement: String| async move {
            debug!(statement = %redact(&statement), "Executing");
            engine.execute(&statement).await.map_err(SidecarError::from)
        };

        run(DISABLE_BINLOG.to_string()).await?;
        report.statements += 1;

        for statement in self.account_statements() {
            run(statement).await?;
            report.statements += 1;
        }

        let read_only = match self.identity.role() {
            Role::Master => 0,
            Role::Replica => 1,
        };
        run(format!("SET GLOBAL read_only = {read_only}")).await?;
        report.statements += 1;

        let current = engine.replication_source().await?;
        let replication = match desired_master {
            None => {
                if let Some(source) = current {
                    return Err(SidecarError::TopologyConflict(format!(
                        "{} is the master but replicates from {}:{}",
                        self.identity.hostname, source.host, source.port
                    )));
                }
                Vec::new()
            }
            Some((host, account)) => self.replication_plan(current.as_ref(), host, account),
        };

        for statement in replication {
            if statement.starts_with("CHANGE MASTER") {
                report.source_changed = true;
            }
            run(statement).await?;
            report.statements += 1;
            report.replication_statements += 1;
        }
        Ok(report)
    }

    fn account_statements(&self) -> Vec<String> {
        let mut statements = Vec::new();
        if let Some(account) = &self.accounts.replication {
            statements.extend(account_statements(account, REPLICATION_GRANTS, None));
        }
        if let Some(account) = &self.accounts.admin {
            statements.extend(account_statements(account, ADMIN_GRANTS, None));
        }
        if let Some(account) = &self.accounts.metrics {
            statements.extend(account_statements(
                account,
                METRICS_GRANTS,
                Some(METRICS_MAX_CONNECTIONS),
            ));
        }
        statements
    }

    fn replication_plan(
        &self,
        current: Option<&ReplicationSource>,
        master_host: &str,
        account: &Account,
    ) -> Vec<String> {
        match current {
            Some(source) if source.points_at(master_host, self.mysql_port) => {
                if source.is_healthy() {
                    debug!(master = %master_host, "Replication already points at master");
                    Vec::new()
                } else {
                    warn!(
                        master = %master_host,
                        io_running = source.io_running,
                        sql_running = source.sql_running,
                        "Replication threads stopped, starting"
                    );
                    vec!["START SLAVE".to_string()]
                }
            }
            current => {
                info!(
                    from = ?current.map(|s| format!("{}:{}", s.host, s.port)),
                    to = %format!("{master_host}:{}", self.mysql_port),
                    "Re-pointing replication"
                );
                vec![
                    "STOP SLAVE".to_string(),
                    change_master_statement(master_host, self.mysql_port, account),
                    "START SLAVE".to_string(),
                ]
            }
        }
    }
}

fn render_server_conf(identity: &NodeIdentity) -> String {
    format!(
        "# Generated by mysql-sidecar; rewritten on every start.\n\
         [mysqld]\n\
         server-id = {}\n\
         report-host = {}\n",
        identity.server_id,
        identity.fqdn()
    )
}

/// Replace `path` atomically via a temporary sibling.
async fn write_replace(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Account names and passwords are validated to contain no quotes or
/// backslashes, so plain single-quoting is safe.
fn account_statements(account: &Account, grants: &str, max_connections: Option<u32>) -> Vec<String> {
    let limit = max_connections
        .map(|n| format!(" WITH MAX_USER_CONNECTIONS {n}"))
        .unwrap_or_default();
    vec![
        format!(
            "CREATE USER IF NOT EXISTS '{}'@'%' IDENTIFIED BY '{}'{}",
            account.user, account.password, limit
        ),
        format!("GRANT {} ON *.* TO '{}'@'%'", grants, account.user),
    ]
}

fn change_master_statement(host: &str, port: u16, account: &Account) -> String {
    format!(
        "CHANGE MASTER TO MASTER_HOST = '{}', MASTER_PORT = {}, MASTER_USER = '{}', \
         MASTER_PASSWORD = '{}', MASTER_AUTO_POSITION = 1",
        host, port, account.user, account.password
    )
}
