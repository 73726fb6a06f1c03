//! Graceful child termination with escalation.
//!
//! Default path: SIGTERM, wait a grace period, then SIGKILL (Unix) or
//! `taskkill /f /t` (Windows). When a custom stop command is configured it
//! runs first with `${PID}` rendered, and escalation only kicks in if the
//! child is still alive afterwards.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::command::split_command;

/// Grace period between the soft stop and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Terminate a child, soft first, hard if the grace period elapses.
pub async fn shutdown_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }

    soft_terminate(child)?;
    match timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Child ignored soft stop, escalating to SIGKILL");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Run a custom stop command (with `${PID}` already rendered by the
/// caller), then wait for the child to exit, escalating on timeout.
pub async fn shutdown_with_command(
    stop_cmd: &str,
    child: &mut Child,
    grace: Duration,
) -> io::Result<ExitStatus> {
    let args = split_command(stop_cmd).map_err(io::Error::other)?;
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| io::Error::other("empty stop command"))?;

    debug!(cmd = %stop_cmd, "Running custom stop command");
    let status = tokio::process::Command::new(program)
        .args(rest)
        .status()
        .await?;
    if !status.success() {
        warn!(code = ?status.code(), "Stop command exited non-zero");
    }

    match timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Child survived stop command, escalating to SIGKILL");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Render `${PID}` in a stop-command template.
pub fn render_stop_command(template: &str, pid: u32) -> String {
    template.replace("${PID}", &pid.to_string())
}

#[cfg(unix)]
fn soft_terminate(child: &Child) -> io::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(()),
        // Process already exited between try_wait and the signal.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

#[cfg(not(unix))]
fn soft_terminate(child: &Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // Windows has no SIGTERM; taskkill tears down the process tree.
    let status = std::process::Command::new("taskkill")
        .args(["/f", "/t", "/pid", &pid.to_string()])
        .status()?;
    if !status.success() {
        warn!(code = ?status.code(), "taskkill exited non-zero");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;
    use tokio::time::sleep;

    #[tokio::test]
    #[cfg(unix)]
    async fn test_shutdown_responds_to_sigterm() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep");

        let result = shutdown_child(&mut child, KILL_GRACE).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_handles_already_exited() {
        let mut child = Command::new("echo")
            .arg("test")
            .spawn()
            .expect("failed to spawn echo");

        sleep(Duration::from_millis(100)).await;

        let result = shutdown_child(&mut child, KILL_GRACE).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_escalation_kills_stubborn_child() {
        // A child that traps SIGTERM and refuses to die.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .spawn()
            .expect("failed to spawn sh");

        // Give the shell a moment to install the trap.
        sleep(Duration::from_millis(200)).await;

        let result = shutdown_child(&mut child, Duration::from_millis(500)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_custom_stop_command() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep");
        let pid = child.id().unwrap();

        let stop_cmd = render_stop_command("kill -TERM ${PID}", pid);
        assert_eq!(stop_cmd, format!("kill -TERM {pid}"));

        let result = shutdown_with_command(&stop_cmd, &mut child, KILL_GRACE).await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_render_stop_command() {
        assert_eq!(
            render_stop_command("docker stop c-${PID}", 42),
            "docker stop c-42"
        );
        assert_eq!(render_stop_command("no pid here", 42), "no pid here");
    }
}
