//! The swap coordinator: owns every process and group.
//!
//! Processes and groups are kept in ID-keyed maps; cross-references go
//! through lookups on this arena rather than mutual strong references.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::{HeaderMap, Method};
use axum::response::Response;
use bytes::Bytes;
use futures_util::future::join_all;
use llamaswap_config::Config;
use llamaswap_runtime::events::{Event, EventBus, ProcessState};
use llamaswap_runtime::logs::LogMonitor;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::group::ProcessGroup;
use crate::process::Process;

/// A process that is not stopped, for `/running`.
#[derive(Debug, Clone, Serialize)]
pub struct RunningInfo {
    pub model: String,
    pub state: ProcessState,
}

/// Top-level orchestrator behind the gateway.
pub struct ProxyManager {
    config: Config,
    processes: HashMap<String, Arc<Process>>,
    /// Sorted by group ID; eviction iterates in this fixed order.
    groups: BTreeMap<String, Arc<ProcessGroup>>,
    group_of: HashMap<String, String>,
    monitor: Arc<LogMonitor>,
    events: EventBus,
    shutting_down: AtomicBool,
}

impl ProxyManager {
    pub fn new(config: Config) -> Result<Arc<Self>, ProxyError> {
        Self::with_parts(config, Arc::new(LogMonitor::default()), EventBus::default())
    }

    /// Build a manager around an existing log monitor and event bus, so a
    /// reload can keep subscribers attached.
    pub fn with_parts(
        config: Config,
        monitor: Arc<LogMonitor>,
        events: EventBus,
    ) -> Result<Arc<Self>, ProxyError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProxyError::Invariant(e.to_string()))?;

        let mut processes = HashMap::new();
        for (id, model) in &config.models {
            let process = Process::new(
                id.clone(),
                model.clone(),
                config.health_check_timeout,
                client.clone(),
                Arc::clone(&monitor),
                events.clone(),
            )?;
            processes.insert(id.clone(), process);
        }

        let mut groups = BTreeMap::new();
        let mut group_of = HashMap::new();
        for (group_id, group_config) in &config.groups {
            for member in &group_config.members {
                group_of.insert(member.clone(), group_id.clone());
            }
            groups.insert(
                group_id.clone(),
                ProcessGroup::new(group_id.clone(), group_config.clone()),
            );
        }

        Ok(Arc::new(Self {
            config,
            processes,
            groups,
            group_of,
            monitor,
            events,
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<LogMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn process(&self, model_id: &str) -> Option<Arc<Process>> {
        self.processes.get(model_id).cloned()
    }

    fn group_for_model(&self, model_id: &str) -> Option<Arc<ProcessGroup>> {
        let group_id = self.group_of.get(model_id)?;
        self.groups.get(group_id).cloned()
    }

    /// Entry point for every request once the gateway knows the model.
    ///
    /// Admission (the concurrency permit) happens before group policy and
    /// readiness, so the per-model cap bounds everything downstream.
    pub async fn proxy_request(
        &self,
        requested_model: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, ProxyError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ProxyError::Shutdown);
        }
        let model_id = self
            .config
            .resolve_model_id(requested_model)
            .ok_or_else(|| ProxyError::UnknownModel(requested_model.to_string()))?
            .to_string();
        let process = self
            .process(&model_id)
            .ok_or_else(|| ProxyError::Invariant(format!("no process for model '{model_id}'")))?;
        let group = self
            .group_for_model(&model_id)
            .ok_or_else(|| ProxyError::Invariant(format!("model '{model_id}' has no group")))?;

        let admission = process.admit().await?;
        group.ensure(self, &model_id).await?;
        process
            .relay(admission, method, path_and_query, headers, body)
            .await
    }

    /// Acquire the group mutexes a load of a member of `requesting` needs,
    /// in sorted-ID order: the requesting group itself plus, when it is
    /// exclusive, every other evictable group (its eviction victims).
    ///
    /// The fixed acquisition order is what makes cross-group eviction
    /// deadlock-free, and holding the victims' locks is what keeps two
    /// exclusive loads from racing past each other's not-yet-started
    /// members.
    pub(crate) async fn lock_groups<'a>(
        &'a self,
        requesting: &ProcessGroup,
    ) -> Vec<tokio::sync::MutexGuard<'a, ()>> {
        let mut guards = Vec::new();
        for (group_id, group) in &self.groups {
            let needed = group_id == requesting.id()
                || (requesting.config().exclusive && group.evictable());
            if needed {
                guards.push(group.ensure_guard().await);
            }
        }
        guards
    }

    /// Stop members of every *other* exclusive, non-persistent group.
    /// Groups are visited in sorted-ID order; the caller already holds
    /// each victim's ensure lock via [`Self::lock_groups`].
    pub(crate) async fn evict_other_exclusive_groups(&self, requesting_group: &str) {
        for (group_id, group) in &self.groups {
            if group_id == requesting_group || !group.evictable() {
                continue;
            }
            group.stop_members_except(self, None).await;
        }
    }

    /// Processes whose state is not `stopped`.
    pub fn list_running(&self) -> Vec<RunningInfo> {
        let mut running: Vec<RunningInfo> = self
            .processes
            .iter()
            .filter(|(_, process)| process.state() != ProcessState::Stopped)
            .map(|(model, process)| RunningInfo {
                model: model.clone(),
                state: process.state(),
            })
            .collect();
        running.sort_by(|a, b| a.model.cmp(&b.model));
        running
    }

    /// Stop one model (resolved through aliases).
    pub async fn unload(&self, requested_model: &str) -> Result<(), ProxyError> {
        let model_id = self
            .config
            .resolve_model_id(requested_model)
            .ok_or_else(|| ProxyError::UnknownModel(requested_model.to_string()))?;
        if let Some(process) = self.process(model_id) {
            process.stop().await;
        }
        Ok(())
    }

    /// Stop every local process. Remote peers are not signalled; peer
    /// forwarding lives outside the core.
    pub async fn stop_cluster(&self) {
        self.unload_all().await;
    }

    /// Stop every process, in parallel.
    pub async fn unload_all(&self) {
        join_all(self.processes.values().map(|process| {
            let process = Arc::clone(process);
            async move { process.stop().await }
        }))
        .await;
    }

    /// Bring up the configured preload list, serialized per group by the
    /// group ensure lock.
    pub async fn preload(&self) {
        for entry in &self.config.hooks.on_startup.preload {
            let Some(model_id) = self.config.resolve_model_id(entry) else {
                continue;
            };
            let model_id = model_id.to_string();
            let Some(group) = self.group_for_model(&model_id) else {
                continue;
            };
            info!(model = %model_id, "Preloading model");
            if let Err(e) = group.ensure(self, &model_id).await {
                warn!(model = %model_id, error = %e, "Preload failed");
            }
        }
    }

    /// Refuse new requests, drain and stop everything, then mark each
    /// process terminally shut down.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down proxy manager");
        self.events.publish(Event::ShuttingDown);
        self.unload_all().await;
        for process in self.processes.values() {
            process.mark_shutdown();
        }
    }
}
