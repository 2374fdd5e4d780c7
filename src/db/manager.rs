//! Database lifecycle management.
//!
//! One [`DatabaseManager`] per process owns the embedded engine handle. The
//! first `acquire()` starts initialization and memoizes it as a shared
//! future, so any number of concurrent first-time callers produce exactly one
//! engine open. A failed initialization is cached and re-surfaced to every
//! caller until an explicit `reset()`; there are no silent retry storms.
//!
//! Recovery never discards data: every failure path that could lose state
//! snapshots the data directory first, and a lock file belonging to a live
//! process is never cleared.

use super::backup::BackupStore;
use super::engine::{lock_file_path, EngineHandle, SqliteEngine, StorageEngine, UNTRACKED_PID_SENTINEL};
use super::schema;
use crate::error::{Error, Result};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type InitFuture = Shared<BoxFuture<'static, std::result::Result<EngineHandle, InitFailure>>>;

/// Cloneable record of a failed initialization, cached so every subsequent
/// `acquire()` re-surfaces the same error until `reset()`.
#[derive(Debug, Clone)]
pub struct InitFailure {
    data_dir: PathBuf,
    backup: Option<PathBuf>,
    reason: String,
    /// Set when the failure was a live lock held by another process.
    locked_pid: Option<String>,
}

impl From<InitFailure> for Error {
    fn from(failure: InitFailure) -> Self {
        match failure.locked_pid {
            Some(pid) => Error::DatabaseLocked {
                data_dir: failure.data_dir,
                pid,
            },
            None => Error::DatabaseInit {
                data_dir: failure.data_dir,
                backup: failure.backup,
                reason: failure.reason,
            },
        }
    }
}

/// Initialization state machine. Transitions:
///
/// ```text
/// Uninitialized -> Initializing -> Ready
///                               -> Failed
/// Ready | Failed | Initializing -> Uninitialized   (reset)
/// ```
enum InitState {
    Uninitialized,
    Initializing(InitFuture),
    Ready(EngineHandle),
    Failed(InitFailure),
}

/// Owns the single embedded-database handle for this process.
pub struct DatabaseManager {
    data_dir: PathBuf,
    engine: Arc<dyn StorageEngine>,
    backups: BackupStore,
    /// Never held across an await point; the in-flight future is cloned out
    /// of the lock before being awaited.
    state: Mutex<InitState>,
}

impl DatabaseManager {
    pub fn new(data_dir: PathBuf, engine: Arc<dyn StorageEngine>) -> Self {
        let backups = BackupStore::new(data_dir.clone());
        Self {
            data_dir,
            engine,
            backups,
            state: Mutex::new(InitState::Uninitialized),
        }
    }

    /// Manager backed by the production SQLite engine.
    pub fn with_sqlite(data_dir: PathBuf) -> Self {
        Self::new(data_dir, Arc::new(SqliteEngine))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Return the ready engine handle, initializing on first call.
    ///
    /// Concurrent first-time callers all await the same in-flight future and
    /// receive clones of the same handle; the engine is opened exactly once.
    /// Once failed, the cached error is returned to every caller until
    /// [`reset`](Self::reset).
    pub async fn acquire(&self) -> Result<EngineHandle> {
        let in_flight = {
            let mut state = self.state.lock();
            match &*state {
                InitState::Ready(handle) => return Ok(handle.clone()),
                InitState::Failed(failure) => return Err(failure.clone().into()),
                InitState::Initializing(fut) => fut.clone(),
                InitState::Uninitialized => {
                    let fut = initialize(
                        Arc::clone(&self.engine),
                        self.data_dir.clone(),
                        self.backups.clone(),
                    )
                    .boxed()
                    .shared();
                    *state = InitState::Initializing(fut.clone());
                    fut
                }
            }
        };

        let result = in_flight.await;

        // Promote the shared result to a terminal state. All concurrent
        // callers race to do this; the Initializing guard makes the write
        // idempotent and keeps a concurrent reset() from being clobbered.
        {
            let mut state = self.state.lock();
            if matches!(&*state, InitState::Initializing(_)) {
                *state = match &result {
                    Ok(handle) => InitState::Ready(handle.clone()),
                    Err(failure) => InitState::Failed(failure.clone()),
                };
            }
        }

        result.map_err(Into::into)
    }

    /// Clear handle, cached error, and in-flight state, plus any stale lock,
    /// so the next `acquire()` re-initializes cleanly.
    pub async fn reset(&self) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, InitState::Uninitialized)
        };

        if let InitState::Ready(handle) = previous {
            if let Err(e) = handle.close().await {
                tracing::warn!("Failed to close engine handle during reset: {}", e);
            }
        }

        let lock_path = lock_file_path(&self.data_dir);
        if lock_path.exists() && is_lock_stale(&lock_path) {
            if let Err(e) = std::fs::remove_file(&lock_path) {
                tracing::warn!(
                    "Failed to clear stale lock {} during reset: {}",
                    lock_path.display(),
                    e
                );
            }
        }
    }

    /// Snapshot the database directory.
    pub fn backup(&self) -> Result<PathBuf> {
        self.backups.create()
    }

    /// Managed backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        self.backups.list()
    }

    /// Replace the database directory with a backup's contents.
    ///
    /// Closes any open handle, snapshots the directory being overwritten,
    /// then swaps in the backup. The next `acquire()` re-opens against the
    /// restored state.
    pub async fn restore_from_backup(&self, backup: &Path) -> Result<()> {
        self.backups.validate(backup)?;
        if !backup.is_dir() {
            return Err(Error::BackupNotFound(backup.to_path_buf()));
        }

        self.reset().await;

        if self.data_dir.is_dir() {
            let safety = self.backups.create()?;
            tracing::info!(
                "Snapshotted current database to {} before restore",
                safety.display()
            );
        }

        self.backups.restore(backup)
    }

    /// Delete a managed backup after validating its name.
    pub fn delete_backup(&self, backup: &Path) -> Result<()> {
        self.backups.delete(backup)
    }

    /// Delete the database directory itself, after snapshotting it.
    ///
    /// The next `acquire()` starts from an empty directory.
    pub async fn delete_database(&self) -> Result<()> {
        self.reset().await;

        if self.data_dir.is_dir() {
            let safety = self.backups.create()?;
            tracing::info!(
                "Snapshotted database to {} before deletion",
                safety.display()
            );
            std::fs::remove_dir_all(&self.data_dir).map_err(|e| {
                Error::Filesystem(format!(
                    "Failed to delete {}: {}",
                    self.data_dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

/// One full initialization attempt. Runs at most once per `acquire()`
/// generation; the caller shares the resulting future.
async fn initialize(
    engine: Arc<dyn StorageEngine>,
    data_dir: PathBuf,
    backups: BackupStore,
) -> std::result::Result<EngineHandle, InitFailure> {
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        return Err(InitFailure {
            data_dir,
            backup: None,
            reason: format!("failed to create data directory: {}", e),
            locked_pid: None,
        });
    }

    let lock_path = lock_file_path(&data_dir);
    if lock_path.exists() {
        if is_lock_stale(&lock_path) {
            tracing::info!(
                "Clearing stale lock file {} from a previous run",
                lock_path.display()
            );
            if let Err(e) = std::fs::remove_file(&lock_path) {
                return Err(InitFailure {
                    data_dir,
                    backup: None,
                    reason: format!("failed to clear stale lock file: {}", e),
                    locked_pid: None,
                });
            }
        } else {
            // A live lock is never removed. Surface who holds it.
            let pid = std::fs::read_to_string(&lock_path)
                .ok()
                .and_then(|c| c.lines().next().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            return Err(InitFailure {
                data_dir,
                backup: None,
                reason: String::new(),
                locked_pid: Some(pid),
            });
        }
    }

    let handle = match engine.open(&data_dir).await {
        Ok(handle) => handle,
        Err(Error::DatabaseLocked { data_dir, pid }) => {
            // The claim appeared between the staleness check and the open.
            return Err(InitFailure {
                data_dir,
                backup: None,
                reason: String::new(),
                locked_pid: Some(pid),
            });
        }
        Err(e) => {
            // The directory may hold a recoverable database; snapshot it
            // before surfacing the failure. Data is never deleted here.
            let backup = create_safety_backup(&backups);
            return Err(InitFailure {
                data_dir,
                backup,
                reason: e.to_string(),
                locked_pid: None,
            });
        }
    };

    let schema_result = async {
        schema::create_schema(handle.conn()).await?;
        schema::run_migrations(handle.conn()).await
    }
    .await;

    if let Err(e) = schema_result {
        let reason = e.to_string();
        if let Err(close_err) = handle.close().await {
            tracing::warn!(
                "Failed to close engine handle after schema failure: {}",
                close_err
            );
        }
        let backup = create_safety_backup(&backups);
        return Err(InitFailure {
            data_dir,
            backup,
            reason: format!("schema initialization failed: {}", reason),
            locked_pid: None,
        });
    }

    Ok(handle)
}

fn create_safety_backup(backups: &BackupStore) -> Option<PathBuf> {
    match backups.create() {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!("Could not create safety backup: {}", e);
            None
        }
    }
}

/// Decide whether a lock file can be safely cleared.
///
/// The sentinel placeholder is always stale. A real PID is probed with a
/// zero-effect liveness signal: "no such process" means stale, a successful
/// probe means live (never cleared). Unreadable or unparsable lock files and
/// probe errors other than ESRCH are treated as stale but logged, so a
/// damaged lock file cannot permanently wedge startup.
pub fn is_lock_stale(lock_path: &Path) -> bool {
    let contents = match std::fs::read_to_string(lock_path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(
                "Cannot read lock file {}: {} - treating as stale",
                lock_path.display(),
                e
            );
            return true;
        }
    };

    let first_line = contents.lines().next().unwrap_or("").trim();
    if first_line == UNTRACKED_PID_SENTINEL {
        return true;
    }

    let pid: u32 = match first_line.parse() {
        Ok(pid) => pid,
        Err(_) => {
            tracing::warn!(
                "Lock file {} has unparsable PID line '{}' - treating as stale",
                lock_path.display(),
                first_line
            );
            return true;
        }
    };

    probe_pid_alive(pid)
}

#[cfg(unix)]
fn probe_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(nix_pid) = crate::error::validate_pid_for_check(pid) else {
        tracing::warn!("Lock file PID {} is out of range - treating as stale", pid);
        return true;
    };

    // Signal 0 probes existence without delivering anything.
    match kill(nix_pid, None) {
        Ok(()) => false,
        Err(Errno::ESRCH) => true,
        Err(e) => {
            tracing::warn!(
                "Liveness probe for PID {} failed with {} - treating lock as stale",
                pid,
                e
            );
            true
        }
    }
}

#[cfg(not(unix))]
fn probe_pid_alive(pid: u32) -> bool {
    tracing::warn!(
        "No liveness probe available on this platform - treating lock for PID {} as stale",
        pid
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_rusqlite::Connection;

    /// Engine that counts opens and can be told to fail the first N of them.
    /// Opens an in-memory database so the schema pass runs for real.
    struct CountingEngine {
        opens: AtomicUsize,
        fail_first: AtomicUsize,
        open_delay: Option<Duration>,
    }

    impl CountingEngine {
        fn new() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                open_delay: None,
            }
        }

        fn failing_once() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(1),
                open_delay: None,
            }
        }

        fn slow() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                open_delay: Some(Duration::from_millis(50)),
            }
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StorageEngine for CountingEngine {
        async fn open(&self, data_dir: &Path) -> Result<EngineHandle> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Filesystem("simulated open failure".to_string()));
            }
            let conn = Connection::open(":memory:").await?;
            Ok(EngineHandle::new(
                conn,
                data_dir.to_path_buf(),
                lock_file_path(data_dir),
            ))
        }
    }

    fn manager_with(engine: Arc<CountingEngine>, dir: &Path) -> DatabaseManager {
        DatabaseManager::new(dir.join("data"), engine)
    }

    // ========================================================================
    // Shared-future memoization
    // ========================================================================

    #[tokio::test]
    async fn concurrent_first_acquires_open_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::slow());
        let manager = Arc::new(manager_with(Arc::clone(&engine), dir.path()));

        let (a, b) = tokio::join!(manager.acquire(), manager.acquire());
        a.unwrap();
        b.unwrap();

        assert_eq!(engine.open_count(), 1, "both callers share one open");
    }

    #[tokio::test]
    async fn repeat_acquire_reuses_ready_handle() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let manager = manager_with(Arc::clone(&engine), dir.path());

        manager.acquire().await.unwrap();
        manager.acquire().await.unwrap();
        assert_eq!(engine.open_count(), 1);
    }

    // ========================================================================
    // Failure caching and reset
    // ========================================================================

    #[tokio::test]
    async fn open_failure_creates_backup_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::failing_once());
        let manager = manager_with(Arc::clone(&engine), dir.path());

        let err = manager.acquire().await.unwrap_err();
        match err {
            Error::DatabaseInit { backup, reason, .. } => {
                let backup = backup.expect("a safety backup is created before surfacing");
                assert!(backup.is_dir());
                assert!(reason.contains("simulated open failure"));
            }
            other => panic!("expected DatabaseInit, got {:?}", other),
        }

        // The failure is cached: no second open happens without reset().
        assert!(manager.acquire().await.is_err());
        assert_eq!(engine.open_count(), 1);
    }

    #[tokio::test]
    async fn reset_allows_reinitialization_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::failing_once());
        let manager = manager_with(Arc::clone(&engine), dir.path());

        assert!(manager.acquire().await.is_err());
        manager.reset().await;

        manager.acquire().await.unwrap();
        assert_eq!(engine.open_count(), 2);
    }

    #[tokio::test]
    async fn reset_after_ready_reopens_on_next_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let manager = manager_with(Arc::clone(&engine), dir.path());

        manager.acquire().await.unwrap();
        manager.reset().await;
        manager.acquire().await.unwrap();
        assert_eq!(engine.open_count(), 2);
    }

    // ========================================================================
    // Lock handling during initialization
    // ========================================================================

    #[tokio::test]
    async fn sentinel_lock_is_cleared_before_open() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let manager = manager_with(Arc::clone(&engine), dir.path());

        std::fs::create_dir_all(manager.data_dir()).unwrap();
        let lock_path = lock_file_path(manager.data_dir());
        std::fs::write(&lock_path, format!("{}\n", UNTRACKED_PID_SENTINEL)).unwrap();

        manager.acquire().await.unwrap();
        assert_eq!(engine.open_count(), 1);
        assert!(!lock_path.exists(), "stale sentinel lock was cleared");
    }

    #[tokio::test]
    async fn live_lock_blocks_initialization_without_touching_it() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let manager = manager_with(Arc::clone(&engine), dir.path());

        std::fs::create_dir_all(manager.data_dir()).unwrap();
        let lock_path = lock_file_path(manager.data_dir());
        // Our own PID is alive by definition.
        std::fs::write(&lock_path, format!("{}\n", std::process::id())).unwrap();

        let err = manager.acquire().await.unwrap_err();
        match err {
            Error::DatabaseLocked { pid, .. } => {
                assert_eq!(pid, std::process::id().to_string());
            }
            other => panic!("expected DatabaseLocked, got {:?}", other),
        }
        assert_eq!(engine.open_count(), 0, "engine never opened past a live lock");
        assert!(lock_path.exists(), "live lock must not be removed");
    }

    // ========================================================================
    // Destructive operations reset state
    // ========================================================================

    #[tokio::test]
    async fn restore_resets_state_and_snapshots_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let manager = manager_with(Arc::clone(&engine), dir.path());

        manager.acquire().await.unwrap();
        std::fs::write(manager.data_dir().join("marker"), b"original").unwrap();
        let backup = manager.backup().unwrap();
        std::fs::write(manager.data_dir().join("marker"), b"changed").unwrap();

        manager.restore_from_backup(&backup).await.unwrap();

        assert_eq!(
            std::fs::read(manager.data_dir().join("marker")).unwrap(),
            b"original"
        );
        // Restore closed the handle and reset state, so acquire re-opens.
        manager.acquire().await.unwrap();
        assert_eq!(engine.open_count(), 2);
        // The overwritten state was snapshotted too: original + pre-restore.
        assert!(manager.list_backups().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn delete_database_snapshots_then_removes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let manager = manager_with(Arc::clone(&engine), dir.path());

        manager.acquire().await.unwrap();
        std::fs::write(manager.data_dir().join("marker"), b"data").unwrap();

        manager.delete_database().await.unwrap();
        assert!(!manager.data_dir().exists());

        let backups = manager.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read(backups[0].join("marker")).unwrap(), b"data");

        // Next acquire starts from scratch.
        manager.acquire().await.unwrap();
        assert_eq!(engine.open_count(), 2);
    }

    #[tokio::test]
    async fn delete_backup_validates_name() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let manager = manager_with(engine, dir.path());

        let bogus = dir.path().join("some-directory");
        std::fs::create_dir(&bogus).unwrap();
        assert!(matches!(
            manager.delete_backup(&bogus),
            Err(Error::InvalidBackupPath(_))
        ));
        assert!(bogus.exists());
    }

    // ========================================================================
    // is_lock_stale
    // ========================================================================

    #[test]
    fn sentinel_is_always_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("postmaster.pid");
        std::fs::write(&lock, format!("{}\n", UNTRACKED_PID_SENTINEL)).unwrap();
        assert!(is_lock_stale(&lock));
    }

    #[test]
    #[cfg(unix)]
    fn live_pid_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("postmaster.pid");
        std::fs::write(&lock, format!("{}\n", std::process::id())).unwrap();
        assert!(!is_lock_stale(&lock));
    }

    #[test]
    #[cfg(unix)]
    fn dead_pid_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("postmaster.pid");
        // Just below the common Linux pid_max; almost certainly unused.
        std::fs::write(&lock, "4194303\n").unwrap();
        assert!(is_lock_stale(&lock));
    }

    #[test]
    fn garbage_and_missing_lock_lines_are_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("postmaster.pid");

        std::fs::write(&lock, "not-a-pid\n").unwrap();
        assert!(is_lock_stale(&lock));

        std::fs::write(&lock, "").unwrap();
        assert!(is_lock_stale(&lock));
    }
}
