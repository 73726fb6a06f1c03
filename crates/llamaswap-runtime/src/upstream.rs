//! Upstream address parsing.
//!
//! Proxy URLs use a scheme-only switch: `http`/`https` dial TCP, `unix`
//! connects to a filesystem socket and synthesizes `http://localhost` for
//! the request line.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Error parsing an upstream proxy URL.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("unsupported upstream scheme in '{0}', expected http, https, or unix")]
    UnsupportedScheme(String),

    #[error("upstream URL '{0}' has no host")]
    MissingHost(String),
}

/// Where an upstream listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddr {
    /// `http://host:port` or `https://host:port`.
    Tcp { base_url: String },
    /// `unix:///path/to.sock`.
    Unix { socket: PathBuf },
}

impl UpstreamAddr {
    /// Parse a proxy URL into an address.
    pub fn parse(proxy: &str) -> Result<Self, UpstreamError> {
        if let Some(path) = proxy.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(UpstreamError::MissingHost(proxy.to_string()));
            }
            return Ok(Self::Unix {
                socket: PathBuf::from(path),
            });
        }

        let rest = proxy
            .strip_prefix("http://")
            .or_else(|| proxy.strip_prefix("https://"));
        match rest {
            Some(rest) if !rest.trim_end_matches('/').is_empty() => Ok(Self::Tcp {
                base_url: proxy.trim_end_matches('/').to_string(),
            }),
            Some(_) => Err(UpstreamError::MissingHost(proxy.to_string())),
            None => Err(UpstreamError::UnsupportedScheme(proxy.to_string())),
        }
    }

    /// Full URL for a request to `path` on this upstream.
    ///
    /// For unix sockets the authority is synthetic; the connection itself
    /// goes to the socket file.
    pub fn url_for(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        match self {
            Self::Tcp { base_url } => format!("{base_url}{path}"),
            Self::Unix { .. } => format!("http://localhost{path}"),
        }
    }

    /// Socket file for unix upstreams.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Self::Tcp { .. } => None,
            Self::Unix { socket } => Some(socket),
        }
    }

    pub const fn is_unix(&self) -> bool {
        matches!(self, Self::Unix { .. })
    }
}

/// Remove a stale unix socket file if present. Called before start and
/// after stop so a crashed upstream cannot wedge the next launch.
pub fn unlink_stale_socket(addr: &UpstreamAddr) {
    if let Some(path) = addr.socket_path() {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(socket = %path.display(), error = %e, "Failed to unlink socket file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http() {
        let addr = UpstreamAddr::parse("http://localhost:9001").unwrap();
        assert_eq!(
            addr,
            UpstreamAddr::Tcp {
                base_url: "http://localhost:9001".to_string()
            }
        );
        assert_eq!(addr.url_for("/health"), "http://localhost:9001/health");
        assert!(!addr.is_unix());
    }

    #[test]
    fn test_parse_trailing_slash() {
        let addr = UpstreamAddr::parse("http://localhost:9001/").unwrap();
        assert_eq!(addr.url_for("v1/models"), "http://localhost:9001/v1/models");
    }

    #[test]
    fn test_parse_unix() {
        let addr = UpstreamAddr::parse("unix:///tmp/llama.sock").unwrap();
        assert_eq!(addr.socket_path(), Some(Path::new("/tmp/llama.sock")));
        assert_eq!(addr.url_for("/health"), "http://localhost/health");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(matches!(
            UpstreamAddr::parse("ftp://host"),
            Err(UpstreamError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            UpstreamAddr::parse("localhost:9001"),
            Err(UpstreamError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_host() {
        assert!(matches!(
            UpstreamAddr::parse("http://"),
            Err(UpstreamError::MissingHost(_))
        ));
    }
}
