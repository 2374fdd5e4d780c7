//! The supervisor's own PID file.
//!
//! External stop tooling reads this file to find and signal the running
//! instance. A stale file (owner no longer running) never blocks a new start;
//! a live file does, since two supervisors would fight over the same children
//! and database.

use super::killtree::pid_alive;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record this process's PID, replacing a stale file if present.
    ///
    /// # Errors
    ///
    /// Fails when another live supervisor already owns the file.
    pub fn write(&self) -> Result<()> {
        if let Some(existing) = Self::read(&self.path)? {
            if pid_alive(existing) {
                return Err(Error::Process(format!(
                    "Another tally-runtime instance is already running (PID {} per {})",
                    existing,
                    self.path.display()
                )));
            }
            tracing::info!(
                "Replacing stale PID file {} (PID {} is gone)",
                self.path.display(),
                existing
            );
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Filesystem(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        std::fs::write(&self.path, format!("{}\n", std::process::id())).map_err(|e| {
            Error::Filesystem(format!(
                "Failed to write PID file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Remove the file. Missing is fine; we only care that it is gone.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Filesystem(format!(
                "Failed to remove PID file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Read a recorded PID. `None` means no instance is recorded: a missing
    /// file is "nothing to stop", not an error. Garbage contents are treated
    /// the same way, with a warning.
    pub fn read(path: &Path) -> Result<Option<u32>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "Failed to read PID file {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        match contents.trim().parse::<u32>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => {
                tracing::warn!(
                    "PID file {} contains '{}', not a PID - ignoring it",
                    path.display(),
                    contents.trim()
                );
                Ok(None)
            }
        }
    }
}
