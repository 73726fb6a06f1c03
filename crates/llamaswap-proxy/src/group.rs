//! Group-level scheduling: swap and exclusive policies.

use std::sync::Arc;

use futures_util::future::join_all;
use llamaswap_config::GroupConfig;
use llamaswap_runtime::events::ProcessState;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::manager::ProxyManager;

/// A set of processes governed by one swap/exclusive/persistent policy.
pub struct ProcessGroup {
    id: String,
    config: GroupConfig,
    /// Serializes competing loads within the group. An exclusive load
    /// also takes the victims' locks, through the manager's sorted-order
    /// sweep; loads of the same member coalesce further down at the
    /// process start lock.
    ensure_lock: Mutex<()>,
}

impl ProcessGroup {
    pub fn new(id: String, config: GroupConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            ensure_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn members(&self) -> &[String] {
        &self.config.members
    }

    /// Members of this group may be evicted by another exclusive group.
    pub const fn evictable(&self) -> bool {
        self.config.exclusive && !self.config.persistent
    }

    /// Lock handle for the manager's ordered acquisition sweep.
    pub(crate) async fn ensure_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ensure_lock.lock().await
    }

    /// Enforce group policy, then bring the target member to `ready`.
    ///
    /// With `swap` on, every other non-stopped member is stopped first (in
    /// parallel). With `exclusive` on, the manager unloads all other
    /// evictable groups before the start.
    pub async fn ensure(&self, manager: &ProxyManager, model_id: &str) -> Result<(), ProxyError> {
        let process = manager
            .process(model_id)
            .ok_or_else(|| ProxyError::UnknownModel(model_id.to_string()))?;

        // Every group mutex this load needs is taken in sorted-ID order:
        // this group, plus each eviction victim when the group is
        // exclusive. Two exclusive loads therefore serialize and can
        // never both observe the other's member as not yet started.
        let _guards = manager.lock_groups(self).await;

        if self.config.swap {
            self.stop_members_except(manager, Some(model_id)).await;
        }
        if self.config.exclusive {
            manager.evict_other_exclusive_groups(&self.id).await;
        }

        process.ensure_ready().await
    }

    /// Stop every member (optionally keeping one), in parallel. Callers
    /// hold the group's ensure lock, taken via the manager's sorted-order
    /// sweep.
    pub(crate) async fn stop_members_except(&self, manager: &ProxyManager, keep: Option<&str>) {
        let stops: Vec<_> = self
            .config
            .members
            .iter()
            .filter(|member| keep != Some(member.as_str()))
            .filter_map(|member| manager.process(member))
            .filter(|process| process.state() != ProcessState::Stopped)
            .collect();
        if stops.is_empty() {
            return;
        }

        debug!(group = %self.id, count = stops.len(), "Stopping group members");
        join_all(stops.iter().map(|process| {
            let process = Arc::clone(process);
            async move {
                info!(model = %process.model_id(), "Unloading for swap");
                process.stop().await;
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evictable_policy() {
        let group = ProcessGroup::new(
            "g".to_string(),
            GroupConfig {
                exclusive: true,
                persistent: false,
                ..GroupConfig::default()
            },
        );
        assert!(group.evictable());

        let persistent = ProcessGroup::new(
            "p".to_string(),
            GroupConfig {
                exclusive: true,
                persistent: true,
                ..GroupConfig::default()
            },
        );
        assert!(!persistent.evictable());

        let shared = ProcessGroup::new(
            "s".to_string(),
            GroupConfig {
                exclusive: false,
                ..GroupConfig::default()
            },
        );
        assert!(!shared.evictable());
    }
}
