//! Directory resolution following the XDG Base Directory specification
//!
//! # Directory Structure
//!
//! - Config: `~/.config/nftsync/` - `config.json`
//! - Data: `~/.local/share/nftsync/` - default base directory (policy file, artifact)
//! - State: `~/.local/state/nftsync/` - log file and audit trail
//!
//! # Example
//!
//! ```
//! use nftsync::utils::{ensure_dirs, get_state_dir};
//!
//! ensure_dirs().ok();
//!
//! if let Some(state) = get_state_dir() {
//!     assert!(state.ends_with("nftsync"));
//! }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "nftsync", "nftsync")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Base directory used when neither the config nor the command line sets one
pub fn default_base_dir() -> PathBuf {
    get_data_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        for dir in [get_config_dir(), get_data_dir(), get_state_dir()]
            .into_iter()
            .flatten()
        {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        for dir in [get_config_dir(), get_data_dir(), get_state_dir()]
            .into_iter()
            .flatten()
        {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}
