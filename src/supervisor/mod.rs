//! Process supervision for the two-process topology.
//!
//! The supervisor starts the API process, waits for its health endpoint,
//! starts the web client, opens a browser, then supervises both children:
//! unexpected exits are retried within a bound, shutdown tears the topology
//! down in reverse startup order with platform-correct process-tree
//! termination.

mod child;
mod killtree;
mod log_relay;
mod pidfile;

pub use child::{ChildExit, ChildProcess, ChildSpec};
pub use killtree::{kill_process_tree, pid_alive, terminate_gracefully};
pub use pidfile::PidFile;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::healthcheck::{wait_until_healthy, HealthChecker, HttpChecker, DEFAULT_POLL_INTERVAL};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which member of the topology a child is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Api,
    Web,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Api => "api",
            Role::Web => "web",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor lifecycle states.
///
/// ```text
/// Idle -> StartingApi -> WaitingHealth -> StartingWeb -> Running
///                                                          |  unexpected exit
///                                             RestartingApi/RestartingWeb
///                                                          |  (bounded)
///         ShuttingDown -> Stopped(code)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    StartingApi,
    WaitingHealth,
    StartingWeb,
    Running,
    RestartingApi,
    RestartingWeb,
    ShuttingDown,
    Stopped(i32),
}

enum ExitOutcome {
    Restarted,
    RestartLimitHit,
    ShutdownRequested,
}

/// Supervises the API and web child processes.
pub struct Supervisor {
    config: RuntimeConfig,
    api_spec: ChildSpec,
    web_spec: ChildSpec,
    children: HashMap<Role, ChildProcess>,
    restart_counts: HashMap<Role, u32>,
    /// Guards against the signal handler and a child-exit handler tearing the
    /// system down twice concurrently.
    stopping: AtomicBool,
    shutdown: CancellationToken,
    exit_tx: mpsc::UnboundedSender<ChildExit>,
    exit_rx: mpsc::UnboundedReceiver<ChildExit>,
    pid_file: PidFile,
    state: SupervisorState,
    health_checker: Option<Box<dyn HealthChecker>>,
    launch_browser: bool,
}

impl Supervisor {
    /// Supervisor for the configured topology.
    pub fn new(config: RuntimeConfig) -> Self {
        let env = config.child_environment();
        let api_spec = ChildSpec {
            role: Role::Api,
            command: config.api_command.clone(),
            env: env.clone(),
        };
        let web_spec = ChildSpec {
            role: Role::Web,
            command: config.web_command.clone(),
            env,
        };
        Self::with_specs(config, api_spec, web_spec)
    }

    /// Supervisor with explicit child specs (the seam tests use to supervise
    /// arbitrary commands).
    pub fn with_specs(config: RuntimeConfig, api_spec: ChildSpec, web_spec: ChildSpec) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let pid_file = PidFile::new(config.pid_file_path());
        Self {
            config,
            api_spec,
            web_spec,
            children: HashMap::new(),
            restart_counts: HashMap::new(),
            stopping: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            exit_tx,
            exit_rx,
            pid_file,
            state: SupervisorState::Idle,
            health_checker: None,
            launch_browser: true,
        }
    }

    /// Token that triggers graceful shutdown when cancelled. The binary wires
    /// SIGINT/SIGTERM to this.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Replace the health checker used to gate web startup. Defaults to an
    /// HTTP check against the configured API health URL.
    pub fn set_health_checker(&mut self, checker: Box<dyn HealthChecker>) {
        self.health_checker = Some(checker);
    }

    /// Whether to open the user's browser once the topology is up.
    pub fn set_launch_browser(&mut self, launch: bool) {
        self.launch_browser = launch;
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run the topology until shutdown. Returns the process exit code:
    /// 0 for a clean stop, 1 for an unrecoverable startup failure (health
    /// timeout or restart bound exceeded).
    pub async fn run(&mut self) -> i32 {
        if let Err(e) = self.pid_file.write() {
            tracing::error!("{}", e.with_suggestion());
            self.set_state(SupervisorState::Stopped(1));
            return 1;
        }

        let code = self.run_topology().await;
        self.set_state(SupervisorState::Stopped(code));
        tracing::info!("Supervisor stopped (exit code {})", code);
        code
    }

    async fn run_topology(&mut self) -> i32 {
        self.set_state(SupervisorState::StartingApi);
        if let Err(e) = self.start_child(Role::Api) {
            tracing::error!("{}", e.with_suggestion());
            self.shutdown_children().await;
            return 1;
        }

        // The web client is never started against an unreachable API: the
        // gate either passes or the whole startup is aborted. The poll has no
        // external cancel; it runs to success or its own timeout.
        self.set_state(SupervisorState::WaitingHealth);
        if let Err(e) = self.wait_for_api_health().await {
            tracing::error!("{}", e.with_suggestion());
            self.shutdown_children().await;
            return 1;
        }

        self.set_state(SupervisorState::StartingWeb);
        if let Err(e) = self.start_child(Role::Web) {
            tracing::error!("{}", e.with_suggestion());
            self.shutdown_children().await;
            return 1;
        }

        tracing::info!("Tally is ready at {}", self.config.web_url());
        if self.launch_browser {
            launch_browser(&self.config.web_url());
        }

        self.set_state(SupervisorState::Running);
        self.supervise().await
    }

    /// Event loop: child exits drive restarts, the shutdown token drives
    /// teardown.
    async fn supervise(&mut self) -> i32 {
        let shutdown = self.shutdown.clone();
        loop {
            // The select only borrows the exit channel; handling happens
            // after the competing futures are dropped.
            let exited = tokio::select! {
                _ = shutdown.cancelled() => None,
                exit = self.exit_rx.recv() => exit,
            };

            let Some(exit) = exited else {
                tracing::info!("Shutdown requested");
                self.shutdown_children().await;
                return 0;
            };

            if self.stopping.load(Ordering::SeqCst) {
                continue;
            }
            match self.handle_unexpected_exit(exit).await {
                ExitOutcome::Restarted => {}
                ExitOutcome::RestartLimitHit => {
                    self.shutdown_children().await;
                    return 1;
                }
                ExitOutcome::ShutdownRequested => {
                    self.shutdown_children().await;
                    return 0;
                }
            }
        }
    }

    async fn handle_unexpected_exit(&mut self, exit: ChildExit) -> ExitOutcome {
        let role = exit.role;
        tracing::warn!(
            "{} process exited unexpectedly (code {:?})",
            role,
            exit.code
        );

        if let Some(child) = self.children.remove(&role) {
            let tail = child.recent_output(15).await;
            if !tail.is_empty() {
                tracing::warn!("Last output from {}:\n{}", role, tail.join("\n"));
            }
        }

        let attempts = {
            let count = self.restart_counts.entry(role).or_insert(0);
            *count += 1;
            *count
        };

        if attempts > self.config.restart_limit {
            let err = Error::RestartLimitExceeded {
                role: role.to_string(),
                attempts: self.config.restart_limit,
            };
            tracing::error!("{}", err.with_suggestion());
            return ExitOutcome::RestartLimitHit;
        }

        self.set_state(match role {
            Role::Api => SupervisorState::RestartingApi,
            Role::Web => SupervisorState::RestartingWeb,
        });
        tracing::info!(
            "Restarting {} in {:?} (attempt {}/{})",
            role,
            self.config.restart_delay,
            attempts,
            self.config.restart_limit
        );

        // The delay is interruptible: a shutdown signal arriving mid-delay
        // must not be followed by another restart attempt.
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                tracing::info!("Shutdown requested during restart delay, not restarting {}", role);
                return ExitOutcome::ShutdownRequested;
            }
            _ = tokio::time::sleep(self.config.restart_delay) => {}
        }

        self.set_state(match role {
            Role::Api => SupervisorState::StartingApi,
            Role::Web => SupervisorState::StartingWeb,
        });
        match self.start_child(role) {
            Ok(()) => {
                self.set_state(SupervisorState::Running);
                ExitOutcome::Restarted
            }
            Err(e) => {
                tracing::error!("Restart of {} failed: {}", role, e);
                ExitOutcome::RestartLimitHit
            }
        }
    }

    fn start_child(&mut self, role: Role) -> Result<()> {
        let spec = match role {
            Role::Api => &self.api_spec,
            Role::Web => &self.web_spec,
        };
        let child = ChildProcess::spawn(spec, self.exit_tx.clone())?;
        self.children.insert(role, child);
        Ok(())
    }

    async fn wait_for_api_health(&mut self) -> Result<()> {
        let timeout = self.config.health_timeout;
        match self.health_checker.take() {
            Some(checker) => {
                let result =
                    wait_until_healthy(checker.as_ref(), timeout, DEFAULT_POLL_INTERVAL).await;
                self.health_checker = Some(checker);
                result
            }
            None => {
                let checker = HttpChecker::new(self.config.api_health_url())?;
                wait_until_healthy(&checker, timeout, DEFAULT_POLL_INTERVAL).await
            }
        }
    }

    /// Idempotent teardown: web first, then API (reverse of startup order),
    /// then the PID file.
    async fn shutdown_children(&mut self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SupervisorState::ShuttingDown);

        for role in [Role::Web, Role::Api] {
            if let Some(child) = self.children.remove(&role) {
                child.stop(self.config.shutdown_grace).await;
            }
        }

        if let Err(e) = self.pid_file.remove() {
            tracing::warn!("{}", e);
        }
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            tracing::debug!("Supervisor state: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

/// Best-effort browser launch; failure is logged, never fatal.
fn launch_browser(url: &str) {
    let mut command = if cfg!(target_os = "macos") {
        let mut c = std::process::Command::new("open");
        c.arg(url);
        c
    } else if cfg!(target_os = "windows") {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", "", url]);
        c
    } else {
        let mut c = std::process::Command::new("xdg-open");
        c.arg(url);
        c
    };

    match command
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(_) => tracing::debug!("Opened browser at {}", url),
        Err(e) => tracing::warn!("Could not open a browser for {}: {}", url, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_specs_carry_runtime_environment() {
        let config = RuntimeConfig::default();
        let supervisor = Supervisor::new(config);
        assert_eq!(supervisor.api_spec.role, Role::Api);
        assert_eq!(supervisor.web_spec.role, Role::Web);
        assert!(supervisor.api_spec.env.contains_key("TALLY_API_PORT"));
        assert!(supervisor.web_spec.env.contains_key("TALLY_DATA_DIR"));
    }

    #[test]
    fn initial_state_is_idle() {
        let supervisor = Supervisor::new(RuntimeConfig::default());
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[test]
    fn role_display_matches_prefix() {
        assert_eq!(Role::Api.to_string(), "api");
        assert_eq!(Role::Web.to_string(), "web");
    }
}
