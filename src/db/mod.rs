//! Embedded database lifecycle: engine opening, stale-lock recovery,
//! idempotent schema, and defensive backups.

mod backup;
mod engine;
mod manager;
mod schema;

pub use backup::BackupStore;
pub use engine::{
    lock_file_path, EngineHandle, SqliteEngine, StorageEngine, DB_FILE_NAME, LOCK_FILE_NAME,
    UNTRACKED_PID_SENTINEL,
};
pub use manager::{is_lock_stale, DatabaseManager};
pub use schema::{create_schema, run_migrations};
