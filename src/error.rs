use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(tally::config::error))]
    Config(String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(tally::filesystem::error))]
    Filesystem(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Process error: {0}")]
    #[diagnostic(
        code(tally::process::error),
        help("Check that the command exists and is executable")
    )]
    Process(String),

    #[error("The {role} process failed to start: {reason}")]
    #[diagnostic(
        code(tally::supervisor::spawn_failed),
        help("Verify the {role} command in your configuration (TALLY_API_COMMAND / TALLY_WEB_COMMAND)")
    )]
    SpawnFailed { role: String, reason: String },

    #[error("The {role} process crashed {attempts} times in a row, giving up")]
    #[diagnostic(
        code(tally::supervisor::restart_limit),
        help("Inspect the [{role}]-prefixed output above for the crash cause before starting again")
    )]
    RestartLimitExceeded { role: String, attempts: u32 },

    #[error("Health check timed out after {elapsed_ms}ms waiting for {url}")]
    #[diagnostic(
        code(tally::health::timeout),
        help("The API server never became ready. Check its output above for startup errors")
    )]
    HealthTimeout { url: String, elapsed_ms: u128 },

    #[error("Database error: {0}")]
    #[diagnostic(code(tally::db::error))]
    Database(#[from] tokio_rusqlite::Error),

    #[error("Could not open the budget database at {}: {reason}", .data_dir.display())]
    #[diagnostic(
        code(tally::db::init_failed),
        help("Your data was NOT deleted. See the hint below for recovery options")
    )]
    DatabaseInit {
        data_dir: PathBuf,
        backup: Option<PathBuf>,
        reason: String,
    },

    #[error("Another instance is already using the database at {} (PID {pid})", .data_dir.display())]
    #[diagnostic(
        code(tally::db::locked),
        help("Stop the other instance first; a live lock is never cleared automatically")
    )]
    DatabaseLocked { data_dir: PathBuf, pid: String },

    #[error("Not a managed backup: {}", .0.display())]
    #[diagnostic(
        code(tally::db::invalid_backup),
        help("Backups are sibling directories named '<database>-backup-<timestamp>'. Refusing to touch anything else")
    )]
    InvalidBackupPath(PathBuf),

    #[error("Backup not found: {}", .0.display())]
    #[diagnostic(code(tally::db::backup_not_found))]
    BackupNotFound(PathBuf),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    ///
    /// Suggestions distinguish "fixable by the operator" (permissions, another
    /// instance running) from "needs a fresh start" (corruption), and always
    /// name the backup location before suggesting anything destructive.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::DatabaseLocked { data_dir, pid } => Some(format!(
                "Another tally instance (PID {}) appears to hold the database at {}. \
                 Stop it with `tally-runtime stop`, or if you are certain nothing is \
                 running, delete {}/postmaster.pid and try again.",
                pid,
                data_dir.display(),
                data_dir.display()
            )),
            Error::DatabaseInit {
                data_dir, backup, ..
            } => {
                let backup_note = match backup {
                    Some(b) => format!(
                        "A safety backup of your data was written to {}. ",
                        b.display()
                    ),
                    None => String::new(),
                };
                Some(format!(
                    "{}If this is a permissions problem, fix ownership of {} and retry. \
                     If the database is corrupted, restore a backup with \
                     `tally-runtime db list` and `tally-runtime db restore <path>`.",
                    backup_note,
                    data_dir.display()
                ))
            }
            Error::HealthTimeout { .. } => Some(
                "The API server started but never answered its health check. \
                 Check whether another process occupies the API port, then run \
                 `tally-runtime start` again."
                    .to_string(),
            ),
            Error::RestartLimitExceeded { role, .. } => Some(format!(
                "The {} process is crash-looping. Its last output lines were printed \
                 above with a [{}] prefix; fix the underlying cause before starting again.",
                role, role
            )),
            Error::InvalidBackupPath(path) => Some(format!(
                "'{}' does not follow the '<database>-backup-<timestamp>' naming \
                 convention. List managed backups with `tally-runtime db list`.",
                path.display()
            )),
            Error::Config(_) => Some(
                "Check the TALLY_* environment variables for typos or out-of-range values."
                    .to_string(),
            ),
            Error::Process(_) => {
                Some("Check that the command exists and is executable".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
#[cfg(unix)]
pub fn validate_pid(pid: u32, role: &str) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for the {} process (refers to process group, not a process)",
                role
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("refusing to operate on PID 1 (init) for the {} process", role),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID {} exceeds i32::MAX for the {} process, cannot convert safely",
                pid, role
            ),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Same as validate_pid but allows PID 1 check to be skipped for existence checks.
/// Use validate_pid for signal operations; use this for read-only checks.
#[cfg(unix)]
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn validate_pid_rejects_zero_one_and_overflow() {
        assert!(validate_pid(0, "api").is_err());
        assert!(validate_pid(1, "api").is_err());
        assert!(validate_pid(i32::MAX as u32 + 1, "api").is_err());
        assert!(validate_pid(1234, "api").is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn validate_pid_for_check_allows_init() {
        // Read-only checks may probe PID 1; signal operations may not.
        assert!(validate_pid_for_check(1).is_some());
        assert!(validate_pid_for_check(0).is_none());
        assert!(validate_pid_for_check(i32::MAX as u32 + 1).is_none());
    }

    #[test]
    fn database_init_suggestion_names_backup_before_destructive_advice() {
        let err = Error::DatabaseInit {
            data_dir: PathBuf::from("/srv/tally/data"),
            backup: Some(PathBuf::from(
                "/srv/tally/data-backup-2026-08-06T10-00-00-000Z",
            )),
            reason: "unable to open database file".to_string(),
        };
        let suggestion = err.suggestion().expect("init failure carries a suggestion");
        let backup_pos = suggestion
            .find("data-backup-")
            .expect("suggestion names the backup");
        let restore_pos = suggestion
            .find("db restore")
            .expect("suggestion mentions restore");
        assert!(
            backup_pos < restore_pos,
            "backup location must come before destructive advice"
        );
    }

    #[test]
    fn locked_suggestion_is_operator_fixable() {
        let err = Error::DatabaseLocked {
            data_dir: PathBuf::from("/srv/tally/data"),
            pid: "4242".to_string(),
        };
        let suggestion = err.suggestion().unwrap();
        assert!(suggestion.contains("4242"));
        assert!(suggestion.contains("tally-runtime stop"));
    }
}
