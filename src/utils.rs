//! XDG directories and single-instance locking
//!
//! Directory layout follows the XDG Base Directory specification:
//!
//! - Config: `~/.config/cordon/` - bootstrap configuration
//! - State: `~/.local/state/cordon/` - audit log, instance lock
//!
//! The kernel's tables and the address collection are host-global and not
//! owned exclusively by this process; concurrent invocations could
//! interleave flush/apply unsafely. The PID lock file turns that
//! documented constraint into an enforced one.

use crate::core::error::{Error, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use tracing::warn;

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("dev", "cordon", "cordon").map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("dev", "cordon", "cordon")
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_config_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_config_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Holds the single-instance lock; removing the file on drop releases it.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove instance lock {:?}: {}", self.path, e);
        }
    }
}

fn pid_is_alive(pid: i32) -> bool {
    // Signal 0 probes existence without delivering anything
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Acquires the single-instance lock in the state directory.
///
/// A lock held by a live process is fatal; a stale lock left by a dead
/// one is replaced.
///
/// # Errors
///
/// Returns [`Error::AlreadyRunning`] when another invocation holds the
/// lock, or an I/O error if the state directory is unusable.
pub fn acquire_instance_lock() -> Result<InstanceLock> {
    let dir = get_state_dir()
        .ok_or_else(|| Error::Internal("state directory not available".to_string()))?;
    let path = dir.join("cordon.pid");

    if let Ok(contents) = std::fs::read_to_string(&path) {
        if let Ok(pid) = contents.trim().parse::<i32>()
            && pid_is_alive(pid)
        {
            return Err(Error::AlreadyRunning(pid));
        }
        warn!("Removing stale instance lock at {:?}", path);
        std::fs::remove_file(&path)?;
    }

    std::fs::write(&path, format!("{}\n", std::process::id()))?;
    Ok(InstanceLock { path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_is_alive_for_self() {
        #[allow(clippy::cast_possible_wrap)]
        let own_pid = std::process::id() as i32;
        assert!(pid_is_alive(own_pid));
    }

    #[test]
    fn test_pid_is_alive_for_impossible_pid() {
        // PID max on Linux is well below this
        assert!(!pid_is_alive(i32::MAX));
    }
}
