//! # Configuration Management
//!
//! Node settings are kept in a TOML file in a platform-appropriate
//! directory (e.g. `~/.config/sharetree/` on Linux). Setting
//! `SHARETREE_CONFIG_DIR` points the node at another directory, which is
//! also how tests isolate themselves.
//!
//! Transaction retry counts and backoff curves are plain settings here
//! rather than constants.

use crate::profile::{ExponentialBackoff, TransactionPolicy};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR_ENV: &str = "SHARETREE_CONFIG_DIR";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Main configuration of a sharetree node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub peer_id: String,
    /// Local directory mirrored by the shared index.
    pub root: PathBuf,
    /// Overlay key the sealed profile is stored under.
    pub profile_location: String,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub notification: NotificationConfig,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        let policy = TransactionPolicy::default();
        Self {
            max_retries: policy.max_retries,
            timeout_ms: policy.timeout.as_millis() as u64,
            backoff_base_ms: 50,
            backoff_max_ms: 1000,
        }
    }
}

impl TransactionConfig {
    pub fn policy(&self) -> TransactionPolicy {
        TransactionPolicy {
            max_retries: self.max_retries,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Fresh configuration for `peer_id` sharing `root`, not yet saved.
    pub fn new(peer_id: impl Into<String>, root: PathBuf, config_file_path: PathBuf) -> Self {
        let peer_id = peer_id.into();
        Self {
            profile_location: format!("profile:{}", whoami_or(&peer_id)),
            peer_id,
            root,
            transaction: TransactionConfig::default(),
            notification: NotificationConfig::default(),
            config_file_path,
        }
    }

    /// Write a new configuration to the config directory.
    pub async fn init(peer_id: impl Into<String>, root: PathBuf) -> Result<Self> {
        let config_dir = Self::config_dir()?;
        tokio::fs::create_dir_all(&config_dir).await?;

        let config = Self::new(peer_id, root, config_dir.join(CONFIG_FILE_NAME));
        config.save().await?;

        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        let config_file = Self::config_dir()?.join(CONFIG_FILE_NAME);

        if !config_file.exists() {
            anyhow::bail!("sharetree not initialized. Run 'sharetree init' first.");
        }

        Self::load_from(&config_file).await
    }

    pub async fn load_from(config_file: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(config_file).await?;
        let mut config: Config = toml::from_str(&content)?;
        config.config_file_path = config_file.to_path_buf();

        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = self.config_file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// The identity key lives next to the config file.
    pub fn identity_path(&self) -> PathBuf {
        self.config_file_path
            .parent()
            .map(|dir| dir.join("identity.key"))
            .unwrap_or_else(|| PathBuf::from("identity.key"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("sharetree");

        Ok(config_dir)
    }
}

/// Owner part of the default profile location: the local user name when
/// known, otherwise the peer id.
fn whoami_or(peer_id: &str) -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| peer_id.to_string())
}
