// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backup Server: serve full snapshots of the local engine over HTTP.
//!
//! # Routes
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET <endpoint>` (`/xbackup`) | chunked snapshot stream, 409 if one is running |
//! | `GET /status` | [`NodeStatus`] JSON, used for donor selection |
//! | `GET /health` | `ok` |
//!
//! # Streaming
//!
//! ```text
//! BackupProducer stdout ──► ReaderStream (stream_buffer_size) ──► chunked body
//!                                                              │
//!                                     producer exit ≠ 0 ──► body ends with error
//! ```
//!
//! One backup at a time: the exclusive lock permit is moved into the body
//! stream and released when the stream finishes or the client goes away. A
//! failed exit is surfaced by terminating the chunked body abnormally, so the
//! client never mistakes a short stream for a complete one.
//!
//! On cancellation the listener stops accepting, in-flight streams get
//! `drain_timeout` to finish, and the rest are aborted (their producers are
//! killed).

pub mod auth;
pub mod types;

use crate::config::{Account, SidecarConfig};
use crate::datadir::DataDirectory;
use crate::engine::AdminEngine;
use crate::error::{Result, SidecarError};
use crate::metrics;
use crate::resilience::Bulkhead;
use crate::tools::{BackupProducer, ToolFuture};
use crate::topology::{NodeIdentity, Role};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use types::{BackupPhase, NodeStatus, HEADER_BACKUP_NODE, HEADER_BACKUP_STARTED_AT, HEALTH_PATH, STATUS_PATH};

/// Shared by every handler.
struct ServerState {
    identity: NodeIdentity,
    producer: Arc<dyn BackupProducer>,
    engine: Arc<dyn AdminEngine>,
    data_dir: Arc<DataDirectory>,
    lock: Bulkhead,
    buf_size: usize,
    /// Set once shutdown starts; new triggers get 503.
    shutting_down: CancellationToken,
    /// Fired when the drain window is over; in-flight streams end.
    abort: CancellationToken,
}

pub struct BackupServer {
    state: Arc<ServerState>,
    endpoint: String,
    credentials: Option<Account>,
    listen_addr: String,
    drain_timeout: Duration,
}

impl BackupServer {
    pub fn new(
        config: &SidecarConfig,
        identity: NodeIdentity,
        producer: Arc<dyn BackupProducer>,
        engine: Arc<dyn AdminEngine>,
        data_dir: Arc<DataDirectory>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                identity,
                producer,
                engine,
                data_dir,
                lock: Bulkhead::exclusive(),
                buf_size: config.backup.stream_buffer_size,
                shutting_down: CancellationToken::new(),
                abort: CancellationToken::new(),
            }),
            endpoint: config.backup.endpoint.clone(),
            credentials: config.backup.credentials.clone(),
            listen_addr: config.backup.listen_addr(),
            drain_timeout: config.backup.drain_timeout_duration(),
        }
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route(&self.endpoint, get(trigger_backup))
            .route(STATUS_PATH, get(node_status));
        if let Some(account) = &self.credentials {
            router = router.route_layer(middleware::from_fn_with_state(
                Arc::new(account.clone()),
                auth::require_basic_auth,
            ));
        }
        router
            // Liveness stays open.
            .route(HEALTH_PATH, get(health))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| SidecarError::ConfigInvalid(format!("cannot bind {}: {e}", self.listen_addr)))?;
        self.serve(listener, cancel).await
    }

    /// Serve on `listener` until `cancel` fires, then drain.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(address = %addr, endpoint = %self.endpoint, "Backup server listening");

        let state = self.state.clone();
        let graceful = state.shutting_down.clone();
        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { graceful.cancelled().await });
        let mut handle = tokio::spawn(async move { server.await });

        tokio::select! {
            result = &mut handle => {
                return match result {
                    Ok(served) => served.map_err(SidecarError::from),
                    Err(e) => Err(SidecarError::Internal(format!("server task: {e}"))),
                };
            }
            _ = cancel.cancelled() => {}
        }

        info!(
            drain_timeout_secs = self.drain_timeout.as_secs(),
            backup_in_progress = state.lock.is_full(),
            "Shutting down backup server"
        );
        state.shutting_down.cancel();

        match tokio::time::timeout(self.drain_timeout, &mut handle).await {
            Ok(Ok(served)) => served?,
            Ok(Err(e)) => return Err(SidecarError::Internal(format!("server task: {e}"))),
            Err(_) => {
                warn!("Drain timeout reached, aborting in-flight backup streams");
                state.abort.cancel();
                // Streams end promptly once aborted; connections then close.
                if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                    handle.abort();
                }
            }
        }
        info!("Backup server stopped");
        Ok(())
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn node_status(State(state): State<Arc<ServerState>>) -> Json<NodeStatus> {
    let identity = &state.identity;
    let replication_lag_secs = match identity.role() {
        Role::Master => None,
        Role::Replica => match state.engine.replication_source().await {
            Ok(Some(source)) if source.is_healthy() => source.seconds_behind,
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Replication status unavailable");
                None
            }
        },
    };
    Json(NodeStatus {
        node: identity.hostname.clone(),
        ordinal: identity.ordinal,
        role: identity.role(),
        data_ready: state.data_dir.is_ready().await,
        replication_lag_secs,
        backup_in_progress: state.lock.is_full(),
    })
}

async fn trigger_backup(State(state): State<Arc<ServerState>>) -> Response {
    if state.shutting_down.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let Some(permit) = state.lock.try_acquire() else {
        metrics::record_backup_trigger(false);
        info!(phase = %BackupPhase::Rejected, "Backup already in progress");
        return (StatusCode::CONFLICT, "backup already in progress").into_response();
    };
    metrics::record_backup_trigger(true);
    metrics::record_backup_in_progress(true);
    let started_at = Utc::now();
    info!(phase = %BackupPhase::Locked, node = %state.identity.hostname, "Backup requested");

    let guard = StreamGuard {
        _permit: permit,
        started: Instant::now(),
        bytes: 0,
        phase: BackupPhase::Locked,
    };

    let produced = match state.producer.produce().await {
        Ok(produced) => produced,
        Err(e) => {
            // The guard records the failure and releases the lock.
            drop(guard.finish(BackupPhase::Failed));
            error!(error = %e, "Could not start backup producer");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("backup failed: {e}")).into_response();
        }
    };

    info!(phase = %BackupPhase::Streaming, "Streaming backup");
    let body = BodyState {
        chunks: ReaderStream::with_capacity(produced.stream, state.buf_size),
        completion: Some(produced.completion),
        abort: state.abort.clone(),
        guard: guard.finish(BackupPhase::Streaming),
    }
    .into_stream();

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(HEADER_BACKUP_NODE, state.identity.hostname.as_str())
        .header(HEADER_BACKUP_STARTED_AT, started_at.to_rfc3339())
        .body(Body::from_stream(body));
    match response {
        Ok(response) => response,
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Holds the lock for one backup and records how it ended when dropped.
struct StreamGuard {
    _permit: OwnedSemaphorePermit,
    started: Instant,
    bytes: u64,
    phase: BackupPhase,
}

impl StreamGuard {
    fn finish(mut self, phase: BackupPhase) -> Self {
        self.phase = phase;
        self
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        match self.phase {
            BackupPhase::Done => info!(
                phase = %self.phase,
                bytes = self.bytes,
                duration_ms = elapsed.as_millis() as u64,
                "Backup stream complete"
            ),
            BackupPhase::Streaming => warn!(
                phase = %BackupPhase::Failed,
                bytes = self.bytes,
                "Backup stream dropped before completion (client went away)"
            ),
            phase => warn!(phase = %phase, bytes = self.bytes, "Backup stream failed"),
        }
        metrics::record_backup_served(self.phase == BackupPhase::Done, self.bytes, elapsed);
        metrics::record_backup_in_progress(false);
    }
}

type ChunkResult = std::io::Result<Bytes>;

struct BodyState {
    chunks: ReaderStream<Box<dyn AsyncRead + Send + Unpin>>,
    completion: Option<ToolFuture<'static, ()>>,
    abort: CancellationToken,
    guard: StreamGuard,
}

impl BodyState {
    fn into_stream(self) -> impl futures::Stream<Item = ChunkResult> + Send + 'static {
        futures::stream::unfold(Some(self), |state| async move {
            let mut state = state?;
            match state.step().await {
                Step::Chunk(bytes) => Some((Ok(bytes), Some(state))),
                Step::Failed(e) => {
                    state.guard.phase = BackupPhase::Failed;
                    Some((Err(e), None))
                }
                Step::Done => {
                    state.guard.phase = BackupPhase::Done;
                    None
                }
            }
        })
    }

    async fn step(&mut self) -> Step {
        let next = tokio::select! {
            next = self.chunks.next() => next,
            _ = self.abort.cancelled() => return Step::Failed(aborted()),
        };
        match next {
            Some(Ok(bytes)) => {
                self.guard.bytes += bytes.len() as u64;
                Step::Chunk(bytes)
            }
            Some(Err(e)) => Step::Failed(e),
            None => {
                let Some(completion) = self.completion.take() else {
                    return Step::Done;
                };
                let exited = tokio::select! {
                    exited = completion => exited,
                    _ = self.abort.cancelled() => return Step::Failed(aborted()),
                };
                match exited {
                    Ok(()) => Step::Done,
                    Err(e) => {
                        error!(error = %e, "Backup producer failed; terminating stream");
                        Step::Failed(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
                    }
                }
            }
        }
    }
}

enum Step {
    Chunk(Bytes),
    Failed(std::io::Error),
    Done,
}

fn aborted() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Interrupted, "server shutting down")
}
