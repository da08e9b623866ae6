use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration.
///
/// Each platform section is optional: a missing section simply means that
/// adapter is never constructed, so there is no half-configured platform
/// state to guard against at runtime.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_storage_config")]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    pub telegram: Option<TelegramConfig>,
    pub vk: Option<VkConfig>,
    pub slack: Option<SlackConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DedupConfig {
    /// Prune dedup markers older than this many days at startup. Unset means
    /// records are kept forever.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VkConfig {
    pub access_token: String,
    pub group_id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    pub bot_token: String,
    /// Port the events/interactivity webhook listens on.
    #[serde(default = "default_slack_port")]
    pub port: u16,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("stepbot.db")
}

fn default_storage_config() -> StorageConfig {
    StorageConfig {
        database_path: default_db_path(),
    }
}

fn default_slack_port() -> u16 {
    3000
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// True when at least one platform section is present.
    pub fn any_platform_enabled(&self) -> bool {
        self.telegram.is_some() || self.vk.is_some() || self.slack.is_some()
    }
}
