//! The llama-swap swap engine and HTTP surface.
//!
//! Owns the process lifecycle state machine, group scheduling (swap and
//! exclusive policies), the top-level swap coordinator, and the axum
//! router the gateway binds.

pub mod error;
pub mod forward;
pub mod group;
pub mod manager;
pub mod process;
pub mod server;

pub use error::ProxyError;
pub use group::ProcessGroup;
pub use manager::{ProxyManager, RunningInfo};
pub use process::Process;
pub use server::{AppState, router};
