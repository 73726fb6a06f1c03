//! Upstream health probing.
//!
//! Polls the configured check endpoint once a second until it answers 200
//! or the health-check deadline passes. Transport is scheme-based: TCP
//! upstreams use a shared reqwest client, unix upstreams get a fresh HTTP/1
//! handshake over the socket per probe.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::upstream::UpstreamAddr;

/// Interval between probes.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// TCP connect timeout per probe.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Overall timeout per probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health probe failure.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("upstream did not become healthy within {timeout}s at {url}")]
    Timeout { url: String, timeout: u64 },

    #[error("health probe could not be constructed: {0}")]
    Client(String),
}

/// Wait until `GET endpoint` on the upstream returns 200, or fail after
/// `timeout_secs`.
pub async fn wait_for_healthy(
    addr: &UpstreamAddr,
    endpoint: &str,
    timeout_secs: u64,
) -> Result<(), HealthError> {
    let endpoint = if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{endpoint}")
    };
    let url = addr.url_for(&endpoint);
    info!(url = %url, "Waiting for upstream to become healthy");

    let client = reqwest::Client::builder()
        .connect_timeout(PROBE_CONNECT_TIMEOUT)
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| HealthError::Client(e.to_string()))?;

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        match probe(&client, addr, &url, &endpoint).await {
            Ok(status) if status == 200 => {
                info!(url = %url, "Upstream is healthy");
                return Ok(());
            }
            Ok(status) => {
                debug!(url = %url, status = %status, "Health probe returned non-200, retrying");
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Health probe failed, retrying");
            }
        }

        if Instant::now() >= deadline {
            return Err(HealthError::Timeout {
                url,
                timeout: timeout_secs,
            });
        }
        sleep(PROBE_INTERVAL).await;
    }
}

async fn probe(
    client: &reqwest::Client,
    addr: &UpstreamAddr,
    url: &str,
    endpoint: &str,
) -> Result<u16, String> {
    match addr {
        UpstreamAddr::Tcp { .. } => client
            .get(url)
            .send()
            .await
            .map(|r| r.status().as_u16())
            .map_err(|e| e.to_string()),
        UpstreamAddr::Unix { socket } => {
            tokio::time::timeout(PROBE_TIMEOUT, unix_probe(socket, endpoint))
                .await
                .map_err(|_| "probe timed out".to_string())?
        }
    }
}

#[cfg(unix)]
async fn unix_probe(socket: &std::path::Path, path: &str) -> Result<u16, String> {
    use http_body_util::Empty;
    use hyper::Request;
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| e.to_string())?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| e.to_string())?;
    tokio::spawn(conn);

    // Origin-form request line over the socket.
    let request = Request::builder()
        .uri(path)
        .header(hyper::header::HOST, "localhost")
        .body(Empty::<bytes::Bytes>::new())
        .map_err(|e| e.to_string())?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| e.to_string())?;
    Ok(response.status().as_u16())
}

#[cfg(not(unix))]
async fn unix_probe(_socket: &std::path::Path, _path: &str) -> Result<u16, String> {
    Err("unix sockets are not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_when_nothing_listens() {
        // Port 1 is essentially never bound; the connect fails fast and the
        // deadline fires after roughly timeout_secs.
        let addr = UpstreamAddr::parse("http://127.0.0.1:1").unwrap();
        let start = Instant::now();
        let err = wait_for_healthy(&addr, "/health", 1).await.unwrap_err();
        assert!(matches!(err, HealthError::Timeout { timeout: 1, .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_unix_probe_missing_socket_retries_until_timeout() {
        let addr = UpstreamAddr::parse("unix:///tmp/definitely-missing.sock").unwrap();
        let err = wait_for_healthy(&addr, "/health", 1).await.unwrap_err();
        assert!(matches!(err, HealthError::Timeout { .. }));
    }
}
