//! Command implementations behind the CLI dispatch in `main.rs`.

use crate::cli::DbCommands;
use tally::config::RuntimeConfig;
use tally::db::DatabaseManager;
use tally::error::{Error, Result};
use tally::healthcheck::{HealthChecker, HttpChecker};
use tally::supervisor::{terminate_gracefully, PidFile, Supervisor};
use std::time::Duration;

/// Run the supervisor in the foreground until shutdown. Returns the process
/// exit code.
pub async fn run_start(config: RuntimeConfig, no_browser: bool) -> i32 {
    let mut supervisor = Supervisor::new(config);
    supervisor.set_launch_browser(!no_browser);

    let token = supervisor.shutdown_token();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        token.cancel();
    });

    supervisor.run().await
}

/// Signal a running instance to stop, waiting briefly for it to exit.
pub async fn run_stop(config: RuntimeConfig) -> Result<()> {
    let pid_path = config.pid_file_path();
    let Some(pid) = PidFile::read(&pid_path)? else {
        // Nothing recorded means nothing to stop, not an error.
        println!("No running instance found ({} is absent)", pid_path.display());
        return Ok(());
    };

    if !tally::supervisor::pid_alive(pid) {
        println!("Instance (PID {}) is no longer running; removing stale PID file", pid);
        PidFile::new(pid_path).remove()?;
        return Ok(());
    }

    println!("Stopping tally-runtime (PID {})...", pid);
    terminate_gracefully(pid, "supervisor")?;

    // The supervisor tears its children down and removes its own PID file;
    // we just wait for it to disappear.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tally::supervisor::pid_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if tally::supervisor::pid_alive(pid) {
        return Err(Error::Process(format!(
            "Instance (PID {}) did not stop within 15s; inspect it manually",
            pid
        )));
    }

    println!("Stopped.");
    Ok(())
}

/// Report supervisor and endpoint status.
pub async fn run_status(config: RuntimeConfig, json: bool) -> Result<()> {
    let pid = PidFile::read(&config.pid_file_path())?;
    let running = pid.is_some_and(tally::supervisor::pid_alive);

    let api_healthy = endpoint_healthy(&config.api_health_url()).await;
    let web_healthy = endpoint_healthy(&config.web_url()).await;

    if json {
        let status = serde_json::json!({
            "running": running,
            "pid": pid,
            "api_healthy": api_healthy,
            "web_healthy": web_healthy,
            "data_dir": config.data_dir,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match (running, pid) {
        (true, Some(pid)) => println!("Supervisor: running (PID {})", pid),
        (false, Some(pid)) => println!("Supervisor: not running (stale PID file, was {})", pid),
        _ => println!("Supervisor: not running"),
    }
    println!(
        "API {}: {}",
        config.api_health_url(),
        if api_healthy { "healthy" } else { "unreachable" }
    );
    println!(
        "Web {}: {}",
        config.web_url(),
        if web_healthy { "healthy" } else { "unreachable" }
    );
    Ok(())
}

async fn endpoint_healthy(url: &str) -> bool {
    match HttpChecker::new(url.to_string()) {
        Ok(checker) => checker.check().await.unwrap_or(false),
        Err(_) => false,
    }
}

/// Database maintenance commands. Destructive ones refuse to run while an
/// instance is up, since the API process owns the engine handle.
pub async fn run_db(command: DbCommands, config: RuntimeConfig) -> Result<()> {
    let manager = DatabaseManager::with_sqlite(config.data_dir.clone());

    match command {
        DbCommands::Backup => {
            let path = manager.backup()?;
            println!("Backup created: {}", path.display());
        }
        DbCommands::List => {
            let backups = manager.list_backups()?;
            if backups.is_empty() {
                println!("No backups found next to {}", config.data_dir.display());
            } else {
                for backup in backups {
                    println!("{}", backup.display());
                }
            }
        }
        DbCommands::Restore { path } => {
            ensure_stopped(&config)?;
            manager.restore_from_backup(&path).await?;
            println!("Restored database from {}", path.display());
        }
        DbCommands::Delete { path } => {
            manager.delete_backup(&path)?;
            println!("Deleted backup {}", path.display());
        }
        DbCommands::Reset { force } => {
            if !force {
                return Err(Error::Config(
                    "db reset deletes the database; pass --force to confirm \
                     (a safety backup is still created)"
                        .to_string(),
                ));
            }
            ensure_stopped(&config)?;
            manager.delete_database().await?;
            println!(
                "Database at {} deleted; a safety backup was created next to it",
                config.data_dir.display()
            );
        }
    }
    Ok(())
}

fn ensure_stopped(config: &RuntimeConfig) -> Result<()> {
    if let Some(pid) = PidFile::read(&config.pid_file_path())? {
        if tally::supervisor::pid_alive(pid) {
            return Err(Error::Process(format!(
                "A tally-runtime instance is running (PID {}); stop it first with \
                 `tally-runtime stop`",
                pid
            )));
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
