// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! mysql-sidecar entry point.

use clap::{Parser, Subcommand};
use mysql_sidecar::{cli, SidecarConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Helper for clustered MySQL nodes: clone, configure and stream backups.
#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"), version)]
struct Args {
    /// Log at debug level (RUST_LOG still takes precedence).
    #[clap(long, global = true)]
    debug: bool,

    /// Optional YAML config file; the environment is applied on top.
    #[clap(long, short, global = true, env = "SIDECAR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
#[clap(rename_all = "kebab-case")]
enum Command {
    /// Clone data from a bucket or a prior node, then write the server config.
    CloneAndInit,
    /// Configure users and replication, then serve backups.
    Run,
    /// Take a backup from a node and push it to object storage.
    TakeBackupTo {
        source_host: String,
        /// Storage URI; a trailing `/` gets a generated object name.
        destination: String,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        info!("Shutdown signal received");
        token.cancel();
    });
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    let config = match SidecarConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(e.exit_code());
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let (name, result) = match &args.command {
        Command::CloneAndInit => ("clone-and-init", cli::clone_and_init(&config, cancel).await),
        Command::Run => ("run", cli::run(&config, cancel).await),
        Command::TakeBackupTo {
            source_host,
            destination,
        } => (
            "take-backup-to",
            cli::take_backup_to(&config, source_host, destination, cancel).await,
        ),
    };

    if let Err(e) = result {
        error!(command = name, error = %e, exit_code = e.exit_code(), "Command failed");
        std::process::exit(e.exit_code());
    }
}
