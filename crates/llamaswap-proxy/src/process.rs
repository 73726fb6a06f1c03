//! One upstream process: lifecycle state machine, concurrency permits, TTL.
//!
//! State diagram:
//!
//! ```text
//! stopped ──start──▶ starting ──health ok──▶ ready
//!                       │                      │
//!                       │ health fail / exit   │ stop / ttl / evict
//!                       ▼                      ▼
//!                     failed                 stopping ──drain + kill──▶ stopped
//!                       │                                                │
//!                       └──────────── manager shutdown ──────────────────▶ shutdown
//! ```
//!
//! `shutdown` is terminal. The child handle exists exactly in starting,
//! ready, and stopping.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use llamaswap_config::ModelConfig;
use llamaswap_runtime::events::{EventBus, ProcessState};
use llamaswap_runtime::logs::LogMonitor;
use llamaswap_runtime::shutdown::{
    KILL_GRACE, render_stop_command, shutdown_child, shutdown_with_command,
};
use llamaswap_runtime::upstream::{UpstreamAddr, unlink_stale_socket};
use llamaswap_runtime::{build_command, spawn_log_readers, split_command, wait_for_healthy};
use tokio::process::Child;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::forward::{forward, rewrite_body};

/// Poll interval while draining in-flight requests.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// A single managed upstream process.
pub struct Process {
    model_id: String,
    config: ModelConfig,
    addr: UpstreamAddr,
    health_check_timeout: u64,

    state_tx: watch::Sender<ProcessState>,
    state_rx: watch::Receiver<ProcessState>,
    /// Serializes start attempts; competing loads of the same model
    /// coalesce behind it.
    start_lock: Mutex<()>,
    /// Serializes stop requests.
    stop_lock: Mutex<()>,
    child: Mutex<Option<Child>>,
    last_error: std::sync::Mutex<Option<String>>,

    semaphore: Option<Arc<Semaphore>>,
    /// Requests holding a permit (admitted; possibly pre-forward).
    admitted: AtomicUsize,
    /// Requests currently relayed to the upstream.
    inflight: AtomicUsize,
    /// Requests blocked on the semaphore. A blocked acquirer inhibits TTL.
    waiting: AtomicUsize,
    ttl_generation: AtomicU64,

    client: reqwest::Client,
    monitor: Arc<LogMonitor>,
    events: EventBus,
    /// Back-reference so `&self` methods can hand owned handles to guards
    /// and the TTL task.
    this: Weak<Self>,
}

impl Process {
    pub fn new(
        model_id: String,
        config: ModelConfig,
        health_check_timeout: u64,
        client: reqwest::Client,
        monitor: Arc<LogMonitor>,
        events: EventBus,
    ) -> Result<Arc<Self>, ProxyError> {
        let addr = UpstreamAddr::parse(&config.proxy)
            .map_err(|e| ProxyError::Invariant(e.to_string()))?;
        let semaphore = (config.concurrency_limit > 0)
            .then(|| Arc::new(Semaphore::new(config.concurrency_limit)));
        let (state_tx, state_rx) = watch::channel(ProcessState::Stopped);

        Ok(Arc::new_cyclic(|this| Self {
            model_id,
            config,
            addr,
            health_check_timeout,
            state_tx,
            state_rx,
            start_lock: Mutex::new(()),
            stop_lock: Mutex::new(()),
            child: Mutex::new(None),
            last_error: std::sync::Mutex::new(None),
            semaphore,
            admitted: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            ttl_generation: AtomicU64::new(0),
            client,
            monitor,
            events,
            this: this.clone(),
        }))
    }

    /// Owned handle to this process. Infallible while any caller holds a
    /// reference derived from the manager's arena.
    fn handle(&self) -> Arc<Self> {
        self.this.upgrade().expect("process outlived its arena")
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Non-blocking state snapshot.
    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    /// Requests currently relayed to the upstream.
    pub fn current_load(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    fn set_state(&self, new: ProcessState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == new {
                return false;
            }
            *state = new;
            true
        });
        if changed {
            debug!(model = %self.model_id, state = %new, "state transition");
            self.events.state_changed(&self.model_id, new);
        }
    }

    fn record_failure(&self, message: &str) {
        *self.last_error.lock().expect("last_error lock poisoned") = Some(message.to_string());
    }

    fn failure(&self) -> String {
        self.last_error
            .lock()
            .expect("last_error lock poisoned")
            .clone()
            .unwrap_or_else(|| "upstream failed to start".to_string())
    }

    /// Acquire a concurrency permit. This happens *before* the state
    /// machine is asked for readiness, so the cap bounds the whole
    /// admission, and a waiter inhibits the TTL timer.
    pub async fn admit(&self) -> Result<AdmissionGuard, ProxyError> {
        if self.state() == ProcessState::Shutdown {
            return Err(ProxyError::Shutdown);
        }
        // Any admission attempt cancels a pending idle timer.
        self.ttl_generation.fetch_add(1, Ordering::SeqCst);

        let permit = if let Some(semaphore) = &self.semaphore {
            let waiting = WaitingGuard::new(self);
            let permit = Arc::clone(semaphore)
                .acquire_owned()
                .await
                .map_err(|_| ProxyError::Shutdown)?;
            drop(waiting);
            Some(permit)
        } else {
            None
        };

        self.admitted.fetch_add(1, Ordering::SeqCst);
        Ok(AdmissionGuard {
            process: self.handle(),
            _permit: permit,
        })
    }

    /// Drive the state machine to `ready`, coalescing with any start
    /// already in flight.
    pub async fn ensure_ready(&self) -> Result<(), ProxyError> {
        loop {
            match self.state() {
                ProcessState::Ready => return Ok(()),
                ProcessState::Shutdown => return Err(ProxyError::Shutdown),
                ProcessState::Starting | ProcessState::Stopping => {
                    let settled = self.wait_for_settle().await?;
                    if settled == ProcessState::Ready {
                        return Ok(());
                    }
                    if settled == ProcessState::Failed {
                        // The attempt we coalesced on failed; its cause is
                        // the answer for every waiter.
                        return Err(ProxyError::StartFailed(self.failure()));
                    }
                }
                ProcessState::Stopped | ProcessState::Failed => {
                    let guard = self.start_lock.lock().await;
                    match self.state() {
                        ProcessState::Ready => return Ok(()),
                        ProcessState::Shutdown => return Err(ProxyError::Shutdown),
                        ProcessState::Stopped | ProcessState::Failed => {
                            let result = self.start_attempt().await;
                            drop(guard);
                            return result;
                        }
                        // Someone else moved the machine while we queued;
                        // re-evaluate from the top.
                        _ => drop(guard),
                    }
                }
            }
        }
    }

    async fn wait_for_settle(&self) -> Result<ProcessState, ProxyError> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| {
                !matches!(s, ProcessState::Starting | ProcessState::Stopping)
            })
            .await
            .map_err(|_| ProxyError::Invariant("state channel closed".to_string()))?;
        Ok(*state)
    }

    /// Launch the child and wait for it to become healthy. Caller holds
    /// the start lock.
    async fn start_attempt(&self) -> Result<(), ProxyError> {
        self.set_state(ProcessState::Starting);
        unlink_stale_socket(&self.addr);

        let args = match split_command(&self.config.cmd) {
            Ok(args) => args,
            Err(e) => return Err(self.fail(format!("invalid cmd: {e}"))),
        };
        let mut command = match build_command(&args, &self.config.env) {
            Ok(command) => command,
            Err(e) => return Err(self.fail(format!("invalid cmd: {e}"))),
        };

        info!(model = %self.model_id, cmd = %args.join(" "), "Starting upstream");
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Err(self.fail(format!("failed to spawn '{}': {e}", args[0]))),
        };
        spawn_log_readers(&mut child, &self.model_id, Arc::clone(&self.monitor));
        *self.child.lock().await = Some(child);

        if self.config.skips_health_check() {
            // Admitted immediately; early requests may see 502 until the
            // upstream socket is actually listening.
            self.set_state(ProcessState::Ready);
            return Ok(());
        }

        let outcome = self.await_healthy().await;
        match outcome {
            StartOutcome::Healthy => {
                self.set_state(ProcessState::Ready);
                info!(model = %self.model_id, "Upstream ready");
                Ok(())
            }
            StartOutcome::Failed(message) => {
                if let Some(mut child) = self.child.lock().await.take() {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                Err(self.fail(message))
            }
            StartOutcome::Interrupted => {
                // A stop arrived mid-start; the stop path owns cleanup.
                Err(ProxyError::Stopping)
            }
        }
    }

    async fn await_healthy(&self) -> StartOutcome {
        let mut state_rx = self.state_rx.clone();
        let mut slot = self.child.lock().await;
        let Some(child) = slot.as_mut() else {
            return StartOutcome::Failed("child vanished during start".to_string());
        };

        tokio::select! {
            health = wait_for_healthy(
                &self.addr,
                &self.config.check_endpoint,
                self.health_check_timeout,
            ) => match health {
                Ok(()) => StartOutcome::Healthy,
                Err(e) => StartOutcome::Failed(e.to_string()),
            },
            status = child.wait() => {
                let detail = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| e.to_string());
                StartOutcome::Failed(format!("upstream exited before healthy: {detail}"))
            }
            _ = state_rx.wait_for(|s| {
                matches!(s, ProcessState::Stopping | ProcessState::Shutdown)
            }) => StartOutcome::Interrupted,
        }
    }

    fn fail(&self, message: String) -> ProxyError {
        warn!(model = %self.model_id, error = %message, "Upstream start failed");
        self.record_failure(&message);
        self.set_state(ProcessState::Failed);
        ProxyError::StartFailed(message)
    }

    /// Relay one request to the (ready) upstream. The returned response
    /// holds the admission until its body completes, including streaming
    /// bodies closed by the client.
    pub async fn relay(
        &self,
        admission: AdmissionGuard,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, ProxyError> {
        match self.state() {
            ProcessState::Ready => {}
            ProcessState::Shutdown => return Err(ProxyError::Shutdown),
            ProcessState::Stopping => return Err(ProxyError::Stopping),
            _ => return Err(ProxyError::StartFailed(self.failure())),
        }

        let body = rewrite_body(
            body,
            &self.config.use_model_name,
            &self.config.filters.strip_params,
            &self.config.filters.set_params,
        );

        self.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard {
            process: self.handle(),
            _admission: admission,
        };

        let response = forward(
            &self.client,
            &self.addr,
            method,
            path_and_query,
            headers,
            body,
        )
        .await?;

        let (parts, body) = response.into_parts();
        let stream = body.into_data_stream().map(move |chunk| {
            // The closure owns the guard; dropping the stream releases it.
            let _hold = &guard;
            chunk
        });
        Ok(Response::from_parts(parts, Body::from_stream(stream)))
    }

    /// Stop the upstream: drain in-flight requests (bounded by twice the
    /// health-check timeout), then terminate the child.
    pub async fn stop(&self) {
        let _stop_guard = self.stop_lock.lock().await;
        match self.state() {
            ProcessState::Stopped | ProcessState::Shutdown | ProcessState::Stopping => return,
            ProcessState::Failed => {
                self.set_state(ProcessState::Stopped);
                return;
            }
            ProcessState::Ready | ProcessState::Starting => {}
        }

        info!(model = %self.model_id, "Stopping upstream");
        self.set_state(ProcessState::Stopping);
        // Wait for an in-flight start attempt to observe the stop.
        let _start_guard = self.start_lock.lock().await;

        let deadline = Instant::now() + Duration::from_secs(self.health_check_timeout * 2);
        while self.inflight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            sleep(DRAIN_POLL).await;
        }
        let remaining = self.inflight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(model = %self.model_id, inflight = remaining, "Drain deadline exceeded, terminating anyway");
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let result = if self.config.cmd_stop.is_empty() {
                shutdown_child(&mut child, KILL_GRACE).await
            } else if let Some(pid) = child.id() {
                let rendered = render_stop_command(&self.config.cmd_stop, pid);
                shutdown_with_command(&rendered, &mut child, KILL_GRACE).await
            } else {
                child.wait().await
            };
            if let Err(e) = result {
                warn!(model = %self.model_id, error = %e, "Error terminating upstream");
            }
        }
        unlink_stale_socket(&self.addr);
        self.set_state(ProcessState::Stopped);
    }

    /// Terminal transition; only the manager's shutdown path calls this
    /// after `stop()` has completed.
    pub fn mark_shutdown(&self) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == ProcessState::Shutdown {
                return false;
            }
            *state = ProcessState::Shutdown;
            true
        });
        if changed {
            self.events
                .state_changed(&self.model_id, ProcessState::Shutdown);
        }
    }

    /// Arm the idle timer: fires `ttl` seconds later unless a new
    /// admission (or waiter) shows up first.
    fn arm_ttl(&self) {
        if self.config.ttl == 0 {
            return;
        }
        let generation = self.ttl_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let process = self.handle();
        handle.spawn(async move {
            sleep(Duration::from_secs(process.config.ttl)).await;
            let still_idle = process.ttl_generation.load(Ordering::SeqCst) == generation
                && process.admitted.load(Ordering::SeqCst) == 0
                && process.waiting.load(Ordering::SeqCst) == 0
                && process.state() == ProcessState::Ready;
            if still_idle {
                info!(model = %process.model_id, ttl = process.config.ttl, "TTL expired, unloading");
                process.stop().await;
            }
        });
    }
}

enum StartOutcome {
    Healthy,
    Failed(String),
    Interrupted,
}

/// Holds a concurrency permit from admission until response completion.
pub struct AdmissionGuard {
    process: Arc<Process>,
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl std::fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard").finish()
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        let before = self.process.admitted.fetch_sub(1, Ordering::SeqCst);
        if before == 1 && self.process.waiting.load(Ordering::SeqCst) == 0 {
            self.process.arm_ttl();
        }
    }
}

/// Counts a request as in-upstream for the drain logic.
struct InflightGuard {
    process: Arc<Process>,
    _admission: AdmissionGuard,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.process.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements the waiter count even when the acquirer is cancelled.
struct WaitingGuard<'a> {
    process: &'a Process,
}

impl<'a> WaitingGuard<'a> {
    fn new(process: &'a Process) -> Self {
        process.waiting.fetch_add(1, Ordering::SeqCst);
        Self { process }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.process.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamaswap_config::ModelConfig;

    fn test_process(config: ModelConfig) -> Arc<Process> {
        Process::new(
            "test-model".to_string(),
            config,
            15,
            reqwest::Client::new(),
            Arc::new(LogMonitor::default()),
            EventBus::default(),
        )
        .unwrap()
    }

    fn sleeper_config() -> ModelConfig {
        ModelConfig {
            cmd: "sleep 30".to_string(),
            proxy: "http://127.0.0.1:1".to_string(),
            check_endpoint: "none".to_string(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_initial_state_is_stopped() {
        let process = test_process(sleeper_config());
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(process.current_load(), 0);
    }

    #[tokio::test]
    async fn test_check_endpoint_none_is_ready_immediately() {
        let process = test_process(sleeper_config());
        process.ensure_ready().await.unwrap();
        assert_eq!(process.state(), ProcessState::Ready);
        process.stop().await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_becomes_failed() {
        let config = ModelConfig {
            cmd: "/nonexistent/binary-that-should-not-exist".to_string(),
            proxy: "http://127.0.0.1:1".to_string(),
            check_endpoint: "none".to_string(),
            ..ModelConfig::default()
        };
        let process = test_process(config);
        let err = process.ensure_ready().await.unwrap_err();
        assert!(matches!(err, ProxyError::StartFailed(_)));
        assert_eq!(process.state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn test_child_exit_during_health_probe_fails_start() {
        // The child exits immediately while the probe targets a dead port,
        // so the start fails on child exit instead of the probe deadline.
        let config = ModelConfig {
            cmd: "true".to_string(),
            proxy: "http://127.0.0.1:1".to_string(),
            check_endpoint: "/health".to_string(),
            ..ModelConfig::default()
        };
        let process = test_process(config);
        let err = process.ensure_ready().await.unwrap_err();
        assert!(matches!(err, ProxyError::StartFailed(_)));
        assert_eq!(process.state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn test_stop_on_stopped_is_noop() {
        let process = test_process(sleeper_config());
        process.stop().await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_process_restarts_on_next_ensure() {
        let config = ModelConfig {
            cmd: "/nonexistent/binary-that-should-not-exist".to_string(),
            proxy: "http://127.0.0.1:1".to_string(),
            check_endpoint: "none".to_string(),
            ..ModelConfig::default()
        };
        let process = test_process(config);
        assert!(process.ensure_ready().await.is_err());
        assert_eq!(process.state(), ProcessState::Failed);
        // A later request retries the start rather than returning a stale
        // failure forever.
        assert!(process.ensure_ready().await.is_err());
    }

    #[tokio::test]
    async fn test_mark_shutdown_is_terminal() {
        let process = test_process(sleeper_config());
        process.mark_shutdown();
        assert_eq!(process.state(), ProcessState::Shutdown);
        let err = process.ensure_ready().await.unwrap_err();
        assert!(matches!(err, ProxyError::Shutdown));
        let err = process.admit().await.unwrap_err();
        assert!(matches!(err, ProxyError::Shutdown));
    }

    #[tokio::test]
    async fn test_admission_respects_concurrency_limit() {
        let config = ModelConfig {
            concurrency_limit: 1,
            ..sleeper_config()
        };
        let process = test_process(config);

        let first = process.admit().await.unwrap();
        // Second admission must block until the first is released.
        let second = tokio::time::timeout(Duration::from_millis(100), process.admit()).await;
        assert!(second.is_err(), "second admission should block");

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(100), process.admit()).await;
        assert!(third.is_ok(), "admission should proceed after release");
    }

    #[tokio::test]
    async fn test_ttl_stops_idle_process() {
        let config = ModelConfig {
            ttl: 1,
            ..sleeper_config()
        };
        let process = test_process(config);
        process.ensure_ready().await.unwrap();
        assert_eq!(process.state(), ProcessState::Ready);

        // Admission + release arms the timer.
        let admission = process.admit().await.unwrap();
        drop(admission);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_admission_cancels_ttl() {
        let config = ModelConfig {
            ttl: 1,
            ..sleeper_config()
        };
        let process = test_process(config);
        process.ensure_ready().await.unwrap();

        let admission = process.admit().await.unwrap();
        drop(admission);
        // A fresh admission before the timer fires keeps the process up.
        let held = process.admit().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(process.state(), ProcessState::Ready);
        drop(held);
        process.stop().await;
    }
}
