//! CLI argument parsing and server bootstrap helpers.

pub mod reload;
pub mod tls;
pub mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Default listen address without TLS.
pub const DEFAULT_LISTEN: &str = ":8080";

/// Default listen address with TLS.
pub const DEFAULT_LISTEN_TLS: &str = ":8443";

/// Transparent proxy that swaps OpenAI-compatible inference backends on
/// demand.
#[derive(Debug, Parser)]
#[command(name = "llama-swap", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Address to listen on, host optional (":8080" binds all interfaces).
    #[arg(long)]
    pub listen: Option<String>,

    /// TLS certificate file (PEM). Requires --tls-key-file.
    #[arg(long)]
    pub tls_cert_file: Option<PathBuf>,

    /// TLS private key file (PEM). Requires --tls-cert-file.
    #[arg(long)]
    pub tls_key_file: Option<PathBuf>,

    /// Reload automatically when the config file changes.
    #[arg(long)]
    pub watch_config: bool,
}

impl Cli {
    /// TLS flags come in pairs.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(_), None) | (None, Some(_)) => Err(
                "--tls-cert-file and --tls-key-file must be provided together".to_string(),
            ),
            _ => Ok(()),
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_file.is_some() && self.tls_key_file.is_some()
    }

    /// The effective listen address, resolving the TLS-dependent default.
    pub fn listen_addr(&self) -> Result<SocketAddr, String> {
        let raw = self.listen.clone().unwrap_or_else(|| {
            if self.tls_enabled() {
                DEFAULT_LISTEN_TLS.to_string()
            } else {
                DEFAULT_LISTEN.to_string()
            }
        });
        normalize_listen(&raw)
    }
}

/// Turn ":8080" into "0.0.0.0:8080" and parse.
pub fn normalize_listen(raw: &str) -> Result<SocketAddr, String> {
    let candidate = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .map_err(|e| format!("invalid listen address '{raw}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["llama-swap"]);
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
        assert!(!cli.watch_config);
        assert!(!cli.tls_enabled());
        assert_eq!(cli.listen_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_tls_default_port() {
        let cli = Cli::parse_from([
            "llama-swap",
            "--tls-cert-file",
            "cert.pem",
            "--tls-key-file",
            "key.pem",
        ]);
        assert!(cli.validate().is_ok());
        assert!(cli.tls_enabled());
        assert_eq!(cli.listen_addr().unwrap().port(), 8443);
    }

    #[test]
    fn test_tls_flags_must_pair() {
        let cli = Cli::parse_from(["llama-swap", "--tls-cert-file", "cert.pem"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from(["llama-swap", "--tls-key-file", "key.pem"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_normalize_listen() {
        assert_eq!(
            normalize_listen(":9090").unwrap(),
            "0.0.0.0:9090".parse().unwrap()
        );
        assert_eq!(
            normalize_listen("127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert!(normalize_listen("not-an-address").is_err());
    }

    #[test]
    fn test_explicit_listen_wins_over_tls_default() {
        let cli = Cli::parse_from([
            "llama-swap",
            "--listen",
            ":9000",
            "--tls-cert-file",
            "cert.pem",
            "--tls-key-file",
            "key.pem",
        ]);
        assert_eq!(cli.listen_addr().unwrap().port(), 9000);
    }
}
