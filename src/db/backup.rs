//! Filesystem snapshots of the database directory.
//!
//! Backups are immutable sibling directories named
//! `<dbpath>-backup-<timestamp>`. The timestamp is ISO8601 with colons and
//! periods replaced by dashes, which keeps names filesystem-safe and makes
//! lexicographic order chronological. Backups are never deleted
//! automatically; `restore` and `delete` refuse to touch any path whose
//! basename does not match the naming convention.

use crate::error::{Error, Result};
use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};

/// Snapshot/list/restore/delete for one database directory.
#[derive(Debug, Clone)]
pub struct BackupStore {
    data_dir: PathBuf,
}

impl BackupStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// `<base>-backup-`, the required prefix of every managed backup's
    /// basename.
    fn prefix(&self) -> Result<String> {
        let base = self
            .data_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Filesystem(format!(
                    "Database path {} has no usable directory name",
                    self.data_dir.display()
                ))
            })?;
        Ok(format!("{}-backup-", base))
    }

    /// Copy the database directory to a timestamped sibling.
    pub fn create(&self) -> Result<PathBuf> {
        if !self.data_dir.is_dir() {
            return Err(Error::Filesystem(format!(
                "Cannot back up {}: not a directory",
                self.data_dir.display()
            )));
        }

        let timestamp = Utc::now()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        let dest = sibling(&self.data_dir, &format!("{}{}", self.prefix()?, timestamp));
        if dest.exists() {
            // Millisecond timestamps collide only when two snapshots race;
            // refusing beats silently merging trees.
            return Err(Error::Filesystem(format!(
                "Backup target {} already exists",
                dest.display()
            )));
        }

        copy_dir_recursive(&self.data_dir, &dest)?;
        tracing::info!("Created database backup at {}", dest.display());
        Ok(dest)
    }

    /// Managed backups for this database, newest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let prefix = self.prefix()?;
        let parent = parent_dir(&self.data_dir);

        let mut backups = Vec::new();
        let entries = match std::fs::read_dir(&parent) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "Failed to scan {}: {}",
                    parent.display(),
                    e
                )));
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && entry.path().is_dir() {
                backups.push(entry.path());
            }
        }

        // The timestamp format sorts lexicographically, so name order is
        // chronological.
        backups.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(backups)
    }

    /// Replace the database directory with the contents of `backup`.
    ///
    /// The caller is responsible for closing any open engine handle and for
    /// snapshotting the current directory first; this method only performs
    /// the validated swap.
    pub fn restore(&self, backup: &Path) -> Result<()> {
        self.validate(backup)?;
        if !backup.is_dir() {
            return Err(Error::BackupNotFound(backup.to_path_buf()));
        }

        if self.data_dir.exists() {
            std::fs::remove_dir_all(&self.data_dir).map_err(|e| {
                Error::Filesystem(format!(
                    "Failed to remove {} before restore: {}",
                    self.data_dir.display(),
                    e
                ))
            })?;
        }

        copy_dir_recursive(backup, &self.data_dir)?;

        // A snapshot taken while the engine was open carries its lock file;
        // nothing holds the restored copy, so the claim must not survive.
        let stale_lock = self.data_dir.join(crate::db::LOCK_FILE_NAME);
        match std::fs::remove_file(&stale_lock) {
            Ok(()) => tracing::debug!("Dropped restored lock file {}", stale_lock.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "Failed to drop restored lock file {}: {}",
                    stale_lock.display(),
                    e
                )));
            }
        }

        tracing::info!(
            "Restored database from {} to {}",
            backup.display(),
            self.data_dir.display()
        );
        Ok(())
    }

    /// Delete a managed backup.
    pub fn delete(&self, backup: &Path) -> Result<()> {
        self.validate(backup)?;
        if !backup.is_dir() {
            return Err(Error::BackupNotFound(backup.to_path_buf()));
        }
        std::fs::remove_dir_all(backup).map_err(|e| {
            Error::Filesystem(format!("Failed to delete {}: {}", backup.display(), e))
        })?;
        tracing::info!("Deleted backup {}", backup.display());
        Ok(())
    }

    /// Reject any path whose basename does not follow the backup naming
    /// convention. Checked before touching disk, so invalid paths have no
    /// side effects.
    pub fn validate(&self, path: &Path) -> Result<()> {
        let prefix = self.prefix()?;
        let valid = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(&prefix) && name.len() > prefix.len());
        if !valid {
            return Err(Error::InvalidBackupPath(path.to_path_buf()));
        }
        Ok(())
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    parent_dir(path).join(name)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| {
        Error::Filesystem(format!("Failed to create {}: {}", dst.display(), e))
    })?;

    let entries = std::fs::read_dir(src)
        .map_err(|e| Error::Filesystem(format!("Failed to read {}: {}", src.display(), e)))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| Error::Filesystem(format!("Failed to read entry: {}", e)))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path).map_err(|e| {
                Error::Filesystem(format!(
                    "Failed to copy {} to {}: {}",
                    src_path.display(),
                    dst_path.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}
