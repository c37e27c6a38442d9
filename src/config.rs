//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use crate::settings::Settings;
use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Crosspost configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Data directory path (settings database, logs).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Discord connection settings.
    #[serde(default)]
    pub discord: DiscordConfig,

    /// Pipeline tunables.
    #[serde(default)]
    pub crosspost: CrosspostConfig,

    /// Per-site toggles.
    #[serde(default)]
    pub sites: SitesConfig,
}

/// Discord connection settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscordConfig {
    /// Bot token. `DISCORD_TOKEN` overrides this.
    pub token: Option<String>,
}

/// Pipeline tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrosspostConfig {
    /// Aggregate estimated memory budget for the queue cache.
    pub cache_budget_bytes: u64,

    /// File count at which posting asks the invoker for confirmation.
    pub confirm_threshold: usize,

    /// Seconds to wait for a confirmation reaction before declining.
    pub confirm_timeout_secs: u64,

    /// Maximum files per outgoing message.
    pub batch_size: usize,

    /// Language that text is translated into when a translator is configured.
    pub target_language: String,

    /// HTTP request timeout.
    pub http_timeout_secs: u64,

    /// Default user agent for upstream requests.
    pub user_agent: String,

    /// Largest response body a single fetch will read.
    pub max_download_bytes: u64,

    /// Guild-wide baseline applied beneath every stored scope.
    pub defaults: Settings,
}

impl Default for CrosspostConfig {
    fn default() -> Self {
        Self {
            cache_budget_bytes: 2 * 1024 * 1024 * 1024,
            confirm_threshold: 25,
            confirm_timeout_secs: 60,
            batch_size: 10,
            target_language: "en".to_string(),
            http_timeout_secs: 30,
            user_agent: concat!("crosspost/", env!("CARGO_PKG_VERSION")).to_string(),
            max_download_bytes: 100 * 1024 * 1024,
            defaults: Settings::default(),
        }
    }
}

impl CrosspostConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Per-site toggles.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SitesConfig {
    #[serde(default)]
    pub bluesky: BlueskyConfig,

    #[serde(default)]
    pub mastodon: MastodonConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlueskyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Public AppView base URL.
    #[serde(default = "default_appview")]
    pub appview: String,
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            appview: default_appview(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MastodonConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Instance hostnames whose status links are recognized.
    #[serde(default = "default_instances")]
    pub instances: Vec<String>,
}

impl Default for MastodonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instances: default_instances(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_appview() -> String {
    "https://public.api.bsky.app".to_string()
}

fn default_instances() -> Vec<String> {
    vec!["mastodon.social".to_string()]
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("crosspost"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            discord: DiscordConfig::default(),
            crosspost: CrosspostConfig::default(),
            sites: SitesConfig::default(),
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("crosspost").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("./config.toml"))
    }

    /// Load configuration from the default path, falling back to defaults
    /// when no file exists.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::finish(Self::default())
        }
    }

    /// Load from a specific config file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(error),
        })?;
        Self::finish(Self::parse(&raw)?)
    }

    /// Parse a TOML document without touching the environment.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn finish(mut config: Self) -> Result<Self> {
        if let Ok(token) = std::env::var("DISCORD_TOKEN") {
            config.discord.token = Some(token);
        }
        if let Ok(data_dir) = std::env::var("CROSSPOST_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!(
                "failed to create data directory: {}",
                config.data_dir.display()
            )
        })?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let crosspost = &self.crosspost;
        if crosspost.batch_size == 0 || crosspost.batch_size > 10 {
            return Err(ConfigError::Invalid(format!(
                "crosspost.batch_size must be between 1 and 10, got {}",
                crosspost.batch_size
            ))
            .into());
        }
        if crosspost.max_download_bytes == 0 {
            return Err(ConfigError::Invalid(
                "crosspost.max_download_bytes must be positive".into(),
            )
            .into());
        }
        if crosspost.confirm_threshold == 0 {
            return Err(
                ConfigError::Invalid("crosspost.confirm_threshold must be positive".into()).into(),
            );
        }
        if self.sites.mastodon.enabled && self.sites.mastodon.instances.is_empty() {
            return Err(ConfigError::Invalid(
                "sites.mastodon.instances must not be empty when mastodon is enabled".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Discord token, required to run the bot.
    pub fn discord_token(&self) -> Result<&str> {
        self.discord
            .token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingKey("discord.token (or DISCORD_TOKEN)".into()).into())
    }

    /// Get the settings database path.
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.redb")
    }

    /// Get the log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
