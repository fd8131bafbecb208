use crate::core::artifact::{RenderOptions, default_lan_cidr};
use crate::core::error::{Error, Result};
use crate::core::objects::ChainPolicy;
use crate::core::retry::RetryConfig;
use crate::utils::{default_base_dir, get_config_dir};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";

/// Persisted nftsync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root for the policy file, the artifact and its sibling directories
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Policy file, relative to `base_dir` unless absolute
    #[serde(default = "default_services_file")]
    pub services_file: PathBuf,
    #[serde(default = "default_lan_cidr")]
    pub lan_cidr: IpNetwork,
    /// Default verdict of the input chain
    #[serde(default)]
    pub input_policy: ChainPolicy,
    #[serde(default = "default_true")]
    pub allow_icmp: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Program run with each notification message as its only argument
    #[serde(default)]
    pub notify_command: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            services_file: default_services_file(),
            lan_cidr: default_lan_cidr(),
            input_policy: ChainPolicy::Drop,
            allow_icmp: true,
            retry: RetryConfig::default(),
            notify_command: None,
        }
    }
}

fn default_services_file() -> PathBuf {
    PathBuf::from("config/services.yaml")
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn services_path(&self) -> PathBuf {
        self.base_dir.join(&self.services_file)
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            lan_cidr: self.lan_cidr,
            policy: self.input_policy,
            allow_icmp: self.allow_icmp,
        }
    }

    /// Rejects values no run could work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.retry.attempts == 0 {
            return Err(Error::Config("retry.attempts must be at least 1".to_string()));
        }
        if self.notify_command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(Error::Config("notify_command must not be empty".to_string()));
        }
        Ok(())
    }
}

/// `<config_dir>/config.json`, if the config directory can be determined
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Saves the config to `path` using an atomic write pattern.
/// 1. Writes to a temporary sibling file created with mode 0o600.
/// 2. Syncs it to disk.
/// 3. Atomically renames it over `path`.
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from `path`, or returns the default if missing or unparsable.
pub async fn load_config(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring unparsable config {}: {e}", path.display());
                AppConfig::default()
            }
        },
        Err(_) => AppConfig::default(),
    }
}
