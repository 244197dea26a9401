//! Privilege elevation for system operations
//!
//! cordon runs as an unprivileged user and elevates for exactly one
//! operation: driving `nft` to mutate the kernel ruleset. No other binary
//! can be elevated through this module.
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Fallback**: `sudo`
//!
//! # Environment Variables
//!
//! - `CORDON_ELEVATION_METHOD`: force a specific method (`sudo`, `run0`,
//!   or `pkexec`). Useful for scripts with sudoers NOPASSWD rules.
//! - `CORDON_TEST_NO_ELEVATION`: bypass elevation entirely (testing only).
//! - `CORDON_NFT_COMMAND`: run this program in place of `nft`, without
//!   elevation. Lets the test suite substitute a mock script.

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `CORDON_ELEVATION_METHOD`
    #[error("invalid CORDON_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// No usable elevation binary was found
    #[error("no elevation method available - install run0 (systemd) or sudo")]
    NoMethodAvailable,

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
///
/// # Arguments
///
/// * `name` - Binary name to search for (e.g., "nft", "ip")
pub(crate) fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn elevate_via(method: &str, program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    if !binary_exists(method) {
        return Err(ElevationError::MethodNotAvailable(method.to_string()));
    }
    let mut cmd = Command::new(method);
    cmd.arg(program).args(args);
    Ok(cmd)
}

/// Internal helper to build an elevated command for a specific program.
///
/// Not exposed publicly - callers go through [`create_elevated_nft_command`]
/// so only the approved binary can be elevated.
fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    // 1. Strict test mode override (highest priority)
    if std::env::var("CORDON_TEST_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Direct root execution (no prompt needed)
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method override (sudoers NOPASSWD setups, etc.)
    if let Ok(method) = std::env::var("CORDON_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => elevate_via(&method, program, args),
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (modern, no SUID), fall back to sudo
    if binary_exists("run0") {
        return elevate_via("run0", program, args);
    }
    if binary_exists("sudo") {
        return elevate_via("sudo", program, args);
    }

    Err(ElevationError::NoMethodAvailable)
}

/// Creates an elevated `nft` command with the specified arguments
///
/// Arguments are passed directly without shell interpretation, preventing
/// command injection; callers validate inputs before reaching this point.
///
/// When `CORDON_NFT_COMMAND` is set, that program is executed directly
/// (no elevation). The test suite points it at a mock script so tests
/// never touch real nftables or require privileges.
///
/// # Errors
///
/// Returns `Err` if the configured elevation method is invalid or no
/// elevation binary is available.
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    if let Ok(mock) = std::env::var("CORDON_NFT_COMMAND")
        && !mock.is_empty()
    {
        let mut cmd = Command::new(mock);
        cmd.args(args);
        return Ok(cmd);
    }

    build_elevated_command("nft", args)
}

#[cfg(test)]
pub(crate) static ENV_VAR_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
