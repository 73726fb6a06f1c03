//! Configuration reload: build, swap, drain.
//!
//! The new manager is swapped in behind the router before the old one is
//! asked to shut down, so requests already in flight finish against the
//! old processes and new requests land on the new config. The gateway
//! never sees a dropped request.

use std::path::Path;
use std::sync::Arc;

use llamaswap_config::Config;
use llamaswap_proxy::manager::ProxyManager;
use llamaswap_proxy::server::AppState;
use llamaswap_runtime::events::Event;
use tracing::{info, warn};

/// Apply the config at `path` to the running server. An invalid file is
/// logged and the previous config stays active.
pub async fn reload(path: &Path, state: &AppState) {
    info!(config = %path.display(), "Configuration changed, reloading");

    let config = match Config::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Reload failed, keeping previous configuration");
            return;
        }
    };

    let current = state.manager();
    // Keep the log ring and event bus so subscribers survive the swap.
    let next = match ProxyManager::with_parts(
        config,
        Arc::clone(current.monitor()),
        current.events().clone(),
    ) {
        Ok(manager) => manager,
        Err(e) => {
            warn!(error = %e, "Reload failed, keeping previous configuration");
            return;
        }
    };

    let previous = state.swap(Arc::clone(&next));
    // Drains every in-flight request, then kills the children.
    previous.shutdown().await;
    next.events().publish(Event::ConfigReloaded);
    info!("Configuration reloaded");

    next.preload().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_reload_keeps_old_manager() {
        let config =
            Config::from_yaml(b"models:\n  a:\n    cmd: sleep 30\n    proxy: http://127.0.0.1:9\n").unwrap();
        let manager = ProxyManager::new(config).unwrap();
        let state = AppState::new(Arc::clone(&manager));

        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("config.yaml");
        std::fs::write(&bad, "models:\n  a:\n    cmd: \"${nope}\"\n").unwrap();

        reload(&bad, &state).await;
        assert!(state.manager().process("a").is_some());

        state.manager().shutdown().await;
    }

    #[tokio::test]
    async fn test_valid_reload_swaps_manager() {
        let config =
            Config::from_yaml(b"models:\n  a:\n    cmd: sleep 30\n    proxy: http://127.0.0.1:9\n").unwrap();
        let manager = ProxyManager::new(config).unwrap();
        let state = AppState::new(Arc::clone(&manager));

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, "models:\n  b:\n    cmd: sleep 30\n    proxy: http://127.0.0.1:9\n").unwrap();

        reload(&file, &state).await;
        assert!(state.manager().process("a").is_none());
        assert!(state.manager().process("b").is_some());

        state.manager().shutdown().await;
    }
}
