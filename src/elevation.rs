//! Resolution of the `nft` program and optional privilege elevation
//!
//! nftsync is meant to run as root from a timer unit. For interactive use by an
//! unprivileged operator, the command can be wrapped in an elevation helper.
//!
//! # Environment Variables
//!
//! - `NFTSYNC_NFT_COMMAND`: Program to run instead of `nft` (used by tests to
//!   point at a fake).
//! - `NFTSYNC_ELEVATION_METHOD`: Wrap the command with `sudo`, `run0` or
//!   `pkexec` when not running as root. Unset means run `nft` directly and let
//!   the preflight check report missing privileges.
//!
//! # Security
//!
//! - Only the resolved nft program is ever elevated
//! - Arguments are passed as a vector, never through a shell

use std::ffi::OsString;
use tokio::process::Command;

pub const NFT_COMMAND_ENV: &str = "NFTSYNC_NFT_COMMAND";
pub const ELEVATION_METHOD_ENV: &str = "NFTSYNC_ELEVATION_METHOD";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `NFTSYNC_ELEVATION_METHOD`
    #[error("Invalid NFTSYNC_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),
}

/// Checks if a binary exists in PATH
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

/// Program used for nft invocations, honouring `NFTSYNC_NFT_COMMAND`
pub fn nft_program() -> OsString {
    std::env::var_os(NFT_COMMAND_ENV)
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| OsString::from("nft"))
}

/// Creates an `nft` command with the given arguments, wrapped for elevation if requested.
///
/// # Errors
///
/// Returns `Err` if `NFTSYNC_ELEVATION_METHOD` names an unknown method or a
/// wrapper that is not installed.
pub fn create_nft_command(args: &[String]) -> Result<Command, ElevationError> {
    let program = nft_program();

    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    let method = std::env::var(ELEVATION_METHOD_ENV)
        .unwrap_or_default()
        .to_lowercase();

    match method.as_str() {
        "" => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
        "sudo" | "run0" | "pkexec" => {
            if !binary_exists(&method) {
                return Err(ElevationError::MethodNotAvailable(method));
            }
            let mut cmd = Command::new(&method);
            cmd.arg(program).args(args);
            Ok(cmd)
        }
        _ => Err(ElevationError::InvalidMethod(method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        // sh should exist on all Unix systems
        assert!(binary_exists("sh"));
        assert!(!binary_exists("nftsync_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_nft_program_override() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var(NFT_COMMAND_ENV, "/opt/fake/nft");
        }
        assert_eq!(nft_program(), OsString::from("/opt/fake/nft"));

        unsafe {
            std::env::remove_var(NFT_COMMAND_ENV);
        }
        assert_eq!(nft_program(), OsString::from("nft"));
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        if nix::unistd::getuid().is_root() {
            // Root never consults the elevation method
            return;
        }

        unsafe {
            std::env::set_var(ELEVATION_METHOD_ENV, "Doas");
        }
        let result = create_nft_command(&["list".to_string(), "tables".to_string()]);
        unsafe {
            std::env::remove_var(ELEVATION_METHOD_ENV);
        }

        assert!(matches!(result, Err(ElevationError::InvalidMethod(m)) if m == "doas"));
    }

    #[test]
    fn test_no_method_runs_directly() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::remove_var(ELEVATION_METHOD_ENV);
        }
        let cmd = create_nft_command(&["--version".to_string()]).unwrap();
        assert_eq!(cmd.as_std().get_program(), nft_program().as_os_str());
    }
}
