//! The storage engine seam.
//!
//! The lifecycle manager never talks to SQLite directly; it opens the engine
//! through [`StorageEngine`], which is also the mock seam for the
//! initialization tests. The production engine is [`SqliteEngine`], which
//! claims its data directory with a lock file before opening the database.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;

/// Name of the engine's data-directory claim file. The first line is the
/// owning PID, or [`UNTRACKED_PID_SENTINEL`] for engines that have no real
/// process to track.
pub const LOCK_FILE_NAME: &str = "postmaster.pid";

/// Sentinel first line meaning "no real PID tracked". Always treated as a
/// stale lock.
pub const UNTRACKED_PID_SENTINEL: &str = "embedded";

/// Database file inside the data directory.
pub const DB_FILE_NAME: &str = "tally.sqlite";

/// Lock file path for a given data directory.
pub fn lock_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LOCK_FILE_NAME)
}

/// Opaque, cheaply-cloneable connection to the embedded database.
///
/// At most one live handle exists per process; the lifecycle manager owns the
/// canonical copy and every `acquire()` caller gets a clone of it. Closing
/// the handle releases the engine's data-directory claim.
#[derive(Clone)]
pub struct EngineHandle {
    conn: Connection,
    data_dir: PathBuf,
    lock_file: PathBuf,
}

impl EngineHandle {
    pub(crate) fn new(conn: Connection, data_dir: PathBuf, lock_file: PathBuf) -> Self {
        Self {
            conn,
            data_dir,
            lock_file,
        }
    }

    /// The underlying database connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// The data directory this handle was opened against.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Close the connection and release the data-directory claim.
    ///
    /// A missing lock file is not an error (an operator may already have
    /// cleaned up by hand).
    pub async fn close(self) -> Result<()> {
        drop(self.conn);
        match tokio::fs::remove_file(&self.lock_file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Filesystem(format!(
                "Failed to remove lock file {}: {}",
                self.lock_file.display(),
                e
            ))),
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

/// Opens the embedded database engine against a data directory.
///
/// Implementations must refuse to open while another claim (lock file) is
/// present; clearing stale claims is the lifecycle manager's job, never the
/// engine's.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn open(&self, data_dir: &Path) -> Result<EngineHandle>;
}

/// SQLite-backed production engine.
///
/// Claims the data directory by atomically creating the lock file with this
/// process's PID, then opens the database in WAL mode. The claim is released
/// when the handle is closed.
pub struct SqliteEngine;

impl SqliteEngine {
    async fn configure(conn: &Connection) -> tokio_rusqlite::Result<()> {
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await
    }

    /// Atomically create the lock file. `create_new` makes claim acquisition
    /// race-free: the second claimant gets `AlreadyExists`, never a partial
    /// overwrite.
    fn claim(lock_path: &Path, data_dir: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let pid = std::fs::read_to_string(lock_path)
                    .ok()
                    .and_then(|c| c.lines().next().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(Error::DatabaseLocked {
                    data_dir: data_dir.to_path_buf(),
                    pid,
                });
            }
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "Failed to create lock file {}: {}",
                    lock_path.display(),
                    e
                )));
            }
        };

        writeln!(file, "{}", std::process::id())
            .map_err(|e| Error::Filesystem(format!("Failed to write lock file: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    async fn open(&self, data_dir: &Path) -> Result<EngineHandle> {
        let lock_path = lock_file_path(data_dir);
        Self::claim(&lock_path, data_dir)?;

        let db_path = data_dir.join(DB_FILE_NAME);
        let opened = async {
            let conn = Connection::open(&db_path).await?;
            Self::configure(&conn).await?;
            Ok::<_, tokio_rusqlite::Error>(conn)
        }
        .await;

        match opened {
            Ok(conn) => Ok(EngineHandle::new(conn, data_dir.to_path_buf(), lock_path)),
            Err(e) => {
                // Release our claim so a later attempt is not blocked by it.
                if let Err(remove_err) = std::fs::remove_file(&lock_path) {
                    tracing::warn!(
                        "Failed to remove lock file {} after open failure: {}",
                        lock_path.display(),
                        remove_err
                    );
                }
                Err(e.into())
            }
        }
    }
}
