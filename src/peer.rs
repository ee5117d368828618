//! HTTP client for a peer's Backup Server.
//!
//! Used two ways:
//!
//! - Bootstrap probes `GET /status` on lower ordinals to pick a donor.
//! - Clone and `take-backup-to` open `GET <endpoint>` and consume the
//!   chunked snapshot stream.
//!
//! Hosts may carry their own port (`db-mysql-0:9090`); otherwise the
//! configured backup port is used.

use crate::config::{Account, BackupConfig};
use crate::error::{Result, SidecarError};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::server::types::{NodeStatus, HEADER_BACKUP_NODE, HEADER_BACKUP_STARTED_AT, STATUS_PATH};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An open snapshot stream from a peer.
pub struct BackupStream {
    /// Producer node, from `X-Backup-Node`.
    pub node: Option<String>,
    /// Production start, from `X-Backup-Started-At`.
    pub started_at: Option<DateTime<Utc>>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// Client for peers' sidecars.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    port: u16,
    endpoint: String,
    credentials: Option<Account>,
    request_timeout: Duration,
}

impl PeerClient {
    /// `request_timeout` bounds connects and status probes; snapshot streams
    /// have no overall deadline.
    pub fn new(backup: &BackupConfig, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| SidecarError::ConfigInvalid(format!("http client: {e}")))?;
        Ok(Self {
            http,
            port: backup.port,
            endpoint: backup.endpoint.clone(),
            credentials: backup.credentials.clone(),
            request_timeout,
        })
    }

    pub fn base_url(&self, host: &str) -> String {
        if host.starts_with("http://") || host.starts_with("https://") {
            return host.trim_end_matches('/').to_string();
        }
        let has_port = match host.strip_prefix('[') {
            Some(rest) => rest.contains("]:"),
            None => host.contains(':'),
        };
        if has_port {
            format!("http://{host}")
        } else {
            format!("http://{host}:{}", self.port)
        }
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        let request = self.http.get(url);
        match &self.credentials {
            Some(account) => request.basic_auth(&account.user, Some(&account.password)),
            None => request,
        }
    }

    /// Fetch a peer's status once.
    pub async fn status(&self, host: &str) -> Result<NodeStatus> {
        let url = format!("{}{}", self.base_url(host), STATUS_PATH);
        let response = self
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| SidecarError::source_unavailable(host, e.to_string()))?;
        if !response.status().is_success() {
            return Err(SidecarError::source_unavailable(
                host,
                format!("status probe returned {}", response.status()),
            ));
        }
        response
            .json::<NodeStatus>()
            .await
            .map_err(|e| SidecarError::source_unavailable(host, format!("bad status body: {e}")))
    }

    /// Probe with a short retry schedule; `None` if the peer never answers.
    pub async fn probe(
        &self,
        host: &str,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Option<NodeStatus> {
        for attempt in 1..=retry.max_attempts {
            match self.status(host).await {
                Ok(status) => {
                    debug!(peer = %host, attempt, ?status, "Peer answered status probe");
                    return Some(status);
                }
                Err(e) => {
                    debug!(peer = %host, attempt, error = %e, "Peer status probe failed");
                    if attempt == retry.max_attempts {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(retry.delay_for_attempt(attempt)) => {}
                    }
                }
            }
        }
        metrics::record_peer_probe(host, false);
        None
    }

    /// Open a snapshot stream.
    ///
    /// 409 is a [`SidecarError::LockConflict`]; any other failure to get a
    /// 2xx is [`SidecarError::SourceUnavailable`].
    pub async fn open_backup(&self, host: &str) -> Result<BackupStream> {
        let url = format!("{}{}", self.base_url(host), self.endpoint);
        info!(peer = %host, url = %url, "Requesting backup stream");
        let response = self
            .get(url)
            .send()
            .await
            .map_err(|e| SidecarError::source_unavailable(host, e.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::CONFLICT => {
                warn!(peer = %host, "Peer is already producing a backup");
                return Err(SidecarError::LockConflict {
                    node: host.to_string(),
                });
            }
            status => {
                return Err(SidecarError::source_unavailable(
                    host,
                    format!("backup request returned {status}"),
                ))
            }
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let node = header(HEADER_BACKUP_NODE);
        let started_at = header(HEADER_BACKUP_STARTED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc));

        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(BackupStream {
            node,
            started_at,
            reader: Box::new(StreamReader::new(Box::pin(body))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PeerClient {
        PeerClient::new(&BackupConfig::default(), Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn test_base_url() {
        let c = client();
        assert_eq!(c.base_url("db-mysql-0.svc"), "http://db-mysql-0.svc:8080");
        assert_eq!(c.base_url("db-mysql-0:9090"), "http://db-mysql-0:9090");
        assert_eq!(c.base_url("http://127.0.0.1:1234/"), "http://127.0.0.1:1234");
        assert_eq!(c.base_url("[::1]:9000"), "http://[::1]:9000");
    }

    #[tokio::test]
    async fn test_status_unreachable_is_source_unavailable() {
        let err = client().status("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, SidecarError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_probe_gives_up() {
        let status = client()
            .probe("127.0.0.1:1", &RetryConfig::testing(), &CancellationToken::new())
            .await;
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn test_open_backup_unreachable() {
        let err = client().open_backup("127.0.0.1:1").await.err().unwrap();
        assert!(matches!(err, SidecarError::SourceUnavailable { .. }));
    }
}
