//! Process runtime and OS-level concerns for llama-swap.
//!
//! Command tokenization, child spawn and termination, health probing, log
//! capture, and the lifecycle event bus. The swap engine itself lives in
//! `llamaswap-proxy` and drives these primitives.

pub mod command;
pub mod events;
pub mod health;
pub mod logs;
pub mod shutdown;
pub mod upstream;

pub use command::{CommandError, build_command, split_command};
pub use events::{Event, EventBus, ProcessState};
pub use health::{HealthError, wait_for_healthy};
pub use logs::{DEFAULT_LOG_RING_CAPACITY, LogMonitor, LogRing, spawn_log_readers};
pub use shutdown::{KILL_GRACE, render_stop_command, shutdown_child, shutdown_with_command};
pub use upstream::{UpstreamAddr, UpstreamError, unlink_stale_socket};
