//! Platform seam for terminating a child's whole process tree.
//!
//! Children are spawned in their own process group, so on POSIX a group
//! signal reaches every descendant. The Windows family has no group-signal
//! primitive; there the tree is terminated with `taskkill /T /F`. Call sites
//! use one `kill_process_tree` entry point and never branch on platform
//! themselves.

use crate::error::Result;

/// Ask a process tree to terminate gracefully.
///
/// On POSIX this is SIGTERM to the child's process group (falling back to the
/// single PID if the group signal fails). On Windows there is no graceful
/// tree signal; the tree is killed outright.
#[cfg(unix)]
pub fn terminate_gracefully(pid: u32, role: &str) -> Result<()> {
    use nix::sys::signal::{self, killpg, Signal};

    let pid = crate::error::validate_pid(pid, role)?;
    killpg(pid, Signal::SIGTERM)
        .or_else(|_| signal::kill(pid, Signal::SIGTERM))
        .map_err(|e| {
            crate::error::Error::Process(format!(
                "Failed to signal {} process group {}: {}",
                role,
                pid.as_raw(),
                e
            ))
        })
}

#[cfg(not(unix))]
pub fn terminate_gracefully(pid: u32, role: &str) -> Result<()> {
    kill_process_tree(pid, role)
}

/// Forcibly terminate a process and all of its descendants.
///
/// A tree that is already gone is success, not an error.
#[cfg(unix)]
pub fn kill_process_tree(pid: u32, role: &str) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, killpg, Signal};

    let pid = crate::error::validate_pid(pid, role)?;
    match killpg(pid, Signal::SIGKILL).or_else(|_| signal::kill(pid, Signal::SIGKILL)) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(crate::error::Error::Process(format!(
            "Failed to kill {} process tree {}: {}",
            role,
            pid.as_raw(),
            e
        ))),
    }
}

#[cfg(not(unix))]
pub fn kill_process_tree(pid: u32, role: &str) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .map_err(|e| {
            crate::error::Error::Process(format!(
                "Failed to run taskkill for {} PID {}: {}",
                role, pid, e
            ))
        })?;

    // taskkill exits non-zero when the process is already gone; that is fine.
    if !output.status.success() {
        tracing::debug!(
            "taskkill for {} PID {} reported: {}",
            role,
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Zero-effect liveness probe used while waiting out the shutdown grace
/// period.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal;

    match crate::error::validate_pid_for_check(pid) {
        Some(pid) => signal::kill(pid, None).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // No cheap probe; the caller falls through to the forced tree kill.
    false
}
