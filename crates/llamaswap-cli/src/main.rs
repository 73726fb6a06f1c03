//! Server entry point - the composition root.
//!
//! Loads the configuration, wires the manager behind the router, and runs
//! the listener (plain or TLS) until interrupted. Exit code 1 on config
//! load failure or a fatal server error.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use llamaswap_cli::{Cli, tls, watcher};
use llamaswap_config::Config;
use llamaswap_proxy::manager::ProxyManager;
use llamaswap_proxy::server::{AppState, router};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("llama-swap: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    cli.validate().map_err(anyhow::Error::msg)?;
    let listen = cli.listen_addr().map_err(anyhow::Error::msg)?;

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("failed to load config '{}'", cli.config.display()))?;

    init_tracing(&config.log_level);
    info!(config = %cli.config.display(), "Configuration loaded");

    let manager = ProxyManager::new(config).context("failed to build proxy manager")?;
    let state = AppState::new(Arc::clone(&manager));
    let app = router(state.clone());

    // Preload declared models in the background; requests are already
    // servable while they warm up.
    let preload_manager = Arc::clone(&manager);
    tokio::spawn(async move { preload_manager.preload().await });

    if cli.watch_config {
        let watch_state = state.clone();
        let config_path = cli.config.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher::watch_config(config_path, watch_state).await {
                warn!(error = %e, "Config watcher stopped");
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(listen = %listen, tls = cli.tls_enabled(), "llama-swap listening");

    if let (Some(cert), Some(key)) = (&cli.tls_cert_file, &cli.tls_key_file) {
        let tls_config = tls::load_tls_config(cert, key)?;
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_token.cancel();
        });
        tls::serve_tls(listener, tls_config, app, shutdown).await?;
    } else {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;
    }

    info!("Shutting down");
    state.manager().shutdown().await;
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install signal handler");
        std::future::pending::<()>().await;
    }
}
