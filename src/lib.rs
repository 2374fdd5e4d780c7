//! # Tally Runtime
//!
//! The embedded runtime supervisor for the Tally self-hosted budgeting app.
//!
//! ## Features
//!
//! - **Process Supervision**: Starts the API and web client processes,
//!   sequences startup through a health gate, restarts crashes within a
//!   bound, and tears the topology down in reverse order on shutdown
//! - **Database Lifecycle**: One shared embedded-database handle per process
//!   with stale-lock recovery and crash-safe initialization that never
//!   deletes user data
//! - **Defensive Backups**: Timestamped directory snapshots before every
//!   destructive operation, with restore/delete guarded by a naming
//!   convention
//! - **Platform-Correct Termination**: POSIX process-group signals, tree
//!   kill on the Windows family, behind one seam
//!
//! ## Quick Start
//!
//! ```no_run
//! use tally::{RuntimeConfig, Supervisor};
//!
//! # async fn example() {
//! let config = RuntimeConfig::from_env().expect("valid configuration");
//! let mut supervisor = Supervisor::new(config);
//! let exit_code = supervisor.run().await;
//! std::process::exit(exit_code);
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! The database manager memoizes initialization as a shared future: any
//! number of concurrent first-time `acquire()` calls produce exactly one
//! engine open, and a cached failure is re-surfaced until an explicit
//! `reset()`. The supervisor is event-driven off child-exit notifications;
//! the only intentionally blocking wait is the time-bounded health poll
//! during startup. Shutdown is idempotent and re-entrant-safe.

pub mod config;
pub mod db;
pub mod error;
pub mod healthcheck;
pub mod supervisor;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use db::{BackupStore, DatabaseManager, EngineHandle, SqliteEngine, StorageEngine};
pub use error::{Error, Result};
pub use healthcheck::{HealthChecker, HttpChecker};
pub use supervisor::{ChildSpec, Role, Supervisor, SupervisorState};
