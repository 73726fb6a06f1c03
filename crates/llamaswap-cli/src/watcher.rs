//! Config file watcher with debounce.
//!
//! Filesystem events for the config file are collected and collapsed: the
//! reload runs only after the file has been quiet for the debounce window,
//! so editors that write in multiple bursts trigger a single reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use llamaswap_proxy::server::AppState;
use tracing::{debug, error, info};

use crate::reload::reload;

/// Minimum quiet period before a change is applied.
pub const DEBOUNCE: Duration = Duration::from_secs(1);

/// Watch `config_path` and reload the server state on changes. Runs until
/// the process exits.
pub async fn watch_config(config_path: PathBuf, state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

    let watched = config_path.clone();
    let mut watcher = notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
        match result {
            Ok(event) => {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    && event.paths.iter().any(|p| paths_match(p, &watched))
                {
                    // Full channel just means a reload is already queued.
                    let _ = tx.try_send(());
                }
            }
            Err(e) => error!(error = %e, "File watcher error"),
        }
    })?;

    // Watch the parent directory so editors that replace the file
    // (rename-over) keep being observed.
    let dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    info!(config = %config_path.display(), "Watching configuration for changes");

    loop {
        if rx.recv().await.is_none() {
            return Ok(());
        }
        // Debounce: swallow follow-up events until the file goes quiet.
        loop {
            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                Ok(Some(())) => {
                    debug!("Coalescing config change events");
                }
                Ok(None) => return Ok(()),
                Err(_) => break,
            }
        }
        reload(&config_path, &state).await;
    }
}

fn paths_match(event_path: &Path, config_path: &Path) -> bool {
    if event_path == config_path {
        return true;
    }
    // Compare by file name as a fallback; watchers may report the path
    // pre- or post-canonicalization.
    match (event_path.file_name(), config_path.file_name()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
