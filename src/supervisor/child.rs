//! Spawning and stopping of supervised child processes.

use super::killtree::{kill_process_tree, pid_alive, terminate_gracefully};
use super::log_relay::LogRelay;
use super::Role;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;

/// What to run for one role of the topology.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub role: Role,
    /// Shell command, run under `sh -c`.
    pub command: String,
    pub env: HashMap<String, String>,
}

/// Exit notification delivered to the supervisor's event loop.
#[derive(Debug, Clone, Copy)]
pub struct ChildExit {
    pub role: Role,
    pub code: Option<i32>,
}

/// A running supervised child.
///
/// The OS `Child` handle itself lives in a background waiter task that reaps
/// the process and reports its exit on the supervisor's channel; stopping is
/// done by PID against the child's process group.
pub struct ChildProcess {
    role: Role,
    pid: u32,
    started_at: DateTime<Utc>,
    relay: LogRelay,
}

impl ChildProcess {
    /// Spawn the child in its own process group with piped output.
    ///
    /// The relay tasks re-emit its output with a role prefix, and a waiter
    /// task sends a [`ChildExit`] on `exit_tx` when the process ends (clean
    /// or not; the supervisor decides what an exit means).
    pub fn spawn(spec: &ChildSpec, exit_tx: mpsc::UnboundedSender<ChildExit>) -> Result<Self> {
        let role = spec.role;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Shutdown signals the whole group explicitly; dropping the
            // handle must not kill a child mid-handoff.
            .kill_on_drop(false);

        // New process group so a group signal reaches every descendant.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| Error::SpawnFailed {
            role: role.to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| Error::SpawnFailed {
            role: role.to_string(),
            reason: "process exited before its PID could be observed".to_string(),
        })?;

        let relay = LogRelay::new(role);
        relay.spawn_relay_tasks(child.stdout.take(), child.stderr.take());

        tracing::info!("Started {} process (PID {})", role, pid);

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("Failed to wait on {} process: {}", role, e);
                    None
                }
            };
            // Receiver gone means the supervisor is already past caring.
            let _ = exit_tx.send(ChildExit { role, code });
        });

        Ok(Self {
            role,
            pid,
            started_at: Utc::now(),
            relay,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Most recent output lines, for crash reporting.
    pub async fn recent_output(&self, tail: usize) -> Vec<String> {
        self.relay.tail(tail).await
    }

    /// Graceful stop: TERM the process group, wait out the grace period,
    /// then force-kill whatever is still alive.
    pub async fn stop(self, grace: Duration) {
        tracing::info!("Stopping {} process (PID {})", self.role, self.pid);

        if let Err(e) = terminate_gracefully(self.pid, self.role.as_str()) {
            tracing::debug!(
                "Graceful signal to {} (PID {}) failed: {} (may already be gone)",
                self.role,
                self.pid,
                e
            );
        }

        let poll_interval = Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + grace;
        while pid_alive(self.pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(poll_interval).await;
        }

        if pid_alive(self.pid) {
            tracing::warn!(
                "{} process (PID {}) did not exit within {:?}, force-killing its tree",
                self.role,
                self.pid,
                grace
            );
            if let Err(e) = kill_process_tree(self.pid, self.role.as_str()) {
                tracing::error!("Force kill of {} failed: {}", self.role, e);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.relay.shutdown().await;
        tracing::info!("{} process stopped", self.role);
    }
}
