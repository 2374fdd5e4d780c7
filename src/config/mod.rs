//! Runtime configuration for the supervisor and database lifecycle manager.
//!
//! Configuration is deliberately small: a data directory, two ports, and the
//! child process commands. Defaults work for a packaged installation;
//! environment variables override them for development and unusual setups.
//! Invalid override values are a configuration error, never a silent fallback.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default directory holding the embedded database and the supervisor PID file.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default port the API process listens on.
pub const DEFAULT_API_PORT: u16 = 5006;

/// Default port the web client process listens on.
pub const DEFAULT_WEB_PORT: u16 = 3000;

/// Default command for the API child process.
pub const DEFAULT_API_COMMAND: &str = "tally-api";

/// Default command for the web client child process.
pub const DEFAULT_WEB_COMMAND: &str = "tally-web";

/// How long the supervisor waits for the API health endpoint before aborting
/// startup. Startup is expected to succeed well within this window; a timeout
/// is treated as a fatal misconfiguration, not something to wait out.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum consecutive restart attempts per child before giving up.
pub const DEFAULT_RESTART_LIMIT: u32 = 3;

/// Fixed delay between restart attempts.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Grace period between SIGTERM and forced process-tree kill during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runtime configuration with environment overrides applied.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the embedded database files, its lock file, and the
    /// supervisor's own PID file. Backups are created as siblings of this
    /// directory.
    pub data_dir: PathBuf,
    pub api_port: u16,
    pub web_port: u16,
    /// Shell command for the API child process.
    pub api_command: String,
    /// Shell command for the web client child process.
    pub web_command: String,
    pub health_timeout: Duration,
    pub restart_limit: u32,
    pub restart_delay: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            api_port: DEFAULT_API_PORT,
            web_port: DEFAULT_WEB_PORT,
            api_command: DEFAULT_API_COMMAND.to_string(),
            web_command: DEFAULT_WEB_COMMAND.to_string(),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            restart_limit: DEFAULT_RESTART_LIMIT,
            restart_delay: DEFAULT_RESTART_DELAY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from the process environment.
    ///
    /// Recognized variables: `TALLY_DATA_DIR`, `TALLY_API_PORT`,
    /// `TALLY_WEB_PORT`, `TALLY_API_COMMAND`, `TALLY_WEB_COMMAND`.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Build a configuration from an explicit variable map.
    ///
    /// Separated from [`from_env`](Self::from_env) so tests can exercise
    /// override handling without mutating process-global state.
    pub fn from_env_map(vars: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = vars.get("TALLY_DATA_DIR") {
            if dir.trim().is_empty() {
                return Err(Error::Config(
                    "TALLY_DATA_DIR is set but empty".to_string(),
                ));
            }
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(port) = vars.get("TALLY_API_PORT") {
            config.api_port = parse_port("TALLY_API_PORT", port)?;
        }

        if let Some(port) = vars.get("TALLY_WEB_PORT") {
            config.web_port = parse_port("TALLY_WEB_PORT", port)?;
        }

        if let Some(cmd) = vars.get("TALLY_API_COMMAND") {
            config.api_command = cmd.clone();
        }

        if let Some(cmd) = vars.get("TALLY_WEB_COMMAND") {
            config.web_command = cmd.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.api_port == self.web_port {
            return Err(Error::Config(format!(
                "API and web ports must differ (both are {})",
                self.api_port
            )));
        }
        if self.api_command.trim().is_empty() {
            return Err(Error::Config("API command is empty".to_string()));
        }
        if self.web_command.trim().is_empty() {
            return Err(Error::Config("web command is empty".to_string()));
        }
        Ok(())
    }

    /// URL the health gate polls before the web client is allowed to start.
    pub fn api_health_url(&self) -> String {
        format!("http://127.0.0.1:{}/health", self.api_port)
    }

    /// URL opened in the user's browser once the topology is up.
    pub fn web_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.web_port)
    }

    /// Path of the supervisor's own PID file.
    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join(".pid")
    }

    /// Environment handed to both child processes so they agree with the
    /// supervisor on ports and data location.
    pub fn child_environment(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            "TALLY_DATA_DIR".to_string(),
            self.data_dir.to_string_lossy().to_string(),
        );
        env.insert("TALLY_API_PORT".to_string(), self.api_port.to_string());
        env.insert("TALLY_WEB_PORT".to_string(), self.web_port.to_string());
        env
    }
}

fn parse_port(name: &str, value: &str) -> Result<u16> {
    let port: u16 = value.trim().parse().map_err(|_| {
        Error::Config(format!(
            "{} must be a port number between 1 and 65535, got '{}'",
            name, value
        ))
    })?;
    if port == 0 {
        return Err(Error::Config(format!("{} must not be 0", name)));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let config = RuntimeConfig::from_env_map(&HashMap::new()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.api_port, DEFAULT_API_PORT);
        assert_eq!(config.web_port, DEFAULT_WEB_PORT);
        assert_eq!(config.restart_limit, 3);
        assert_eq!(config.restart_delay, Duration::from_secs(1));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let config = RuntimeConfig::from_env_map(&vars(&[
            ("TALLY_DATA_DIR", "/srv/tally/data"),
            ("TALLY_API_PORT", "9100"),
            ("TALLY_WEB_PORT", "9101"),
            ("TALLY_API_COMMAND", "node server.js"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/tally/data"));
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.web_port, 9101);
        assert_eq!(config.api_command, "node server.js");
        // Untouched fields keep their defaults.
        assert_eq!(config.web_command, DEFAULT_WEB_COMMAND);
    }

    #[test]
    fn invalid_port_is_an_error_not_a_fallback() {
        let result = RuntimeConfig::from_env_map(&vars(&[("TALLY_API_PORT", "not-a-port")]));
        assert!(result.is_err());

        let result = RuntimeConfig::from_env_map(&vars(&[("TALLY_API_PORT", "0")]));
        assert!(result.is_err());

        let result = RuntimeConfig::from_env_map(&vars(&[("TALLY_API_PORT", "70000")]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_identical_ports() {
        let result = RuntimeConfig::from_env_map(&vars(&[
            ("TALLY_API_PORT", "8080"),
            ("TALLY_WEB_PORT", "8080"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_data_dir() {
        let result = RuntimeConfig::from_env_map(&vars(&[("TALLY_DATA_DIR", "  ")]));
        assert!(result.is_err());
    }

    #[test]
    fn derived_paths_and_urls() {
        let config = RuntimeConfig::from_env_map(&vars(&[("TALLY_DATA_DIR", "/tmp/d")])).unwrap();
        assert_eq!(config.pid_file_path(), PathBuf::from("/tmp/d/.pid"));
        assert_eq!(
            config.api_health_url(),
            format!("http://127.0.0.1:{}/health", DEFAULT_API_PORT)
        );
        assert_eq!(
            config.web_url(),
            format!("http://127.0.0.1:{}", DEFAULT_WEB_PORT)
        );
    }

    #[test]
    fn child_environment_carries_ports_and_data_dir() {
        let config = RuntimeConfig::default();
        let env = config.child_environment();
        assert_eq!(env.get("TALLY_API_PORT").unwrap(), "5006");
        assert_eq!(env.get("TALLY_WEB_PORT").unwrap(), "3000");
        assert!(env.contains_key("TALLY_DATA_DIR"));
    }
}
