//! Layered configuration: a TOML file overridden by `CHATFS_*` environment
//! variables, following the same two-source layering as `fula-cli`'s
//! gateway config, but loaded through the `config` crate instead of being
//! hand-assembled.
//!
//! Field names are single tokens (`bottoken`, not `bot_token`) so that the
//! `config` crate's environment-variable splitting, which treats every
//! underscore after the prefix as a path separator, lines up with the flat
//! `CHATFS_DISCORD_BOTTOKEN` style variable names `chatfsmount` also reads.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub bottoken: String,
    pub channelid: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSystemConfig {
    #[serde(default = "FileSystemConfig::default_drive_letter")]
    pub driveletter: String,
    #[serde(default = "FileSystemConfig::default_cache_size_mb")]
    pub cachesizemb: u32,
}

impl FileSystemConfig {
    fn default_drive_letter() -> String {
        "Z".to_string()
    }

    fn default_cache_size_mb() -> u32 {
        256
    }
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        Self { driveletter: Self::default_drive_letter(), cachesizemb: Self::default_cache_size_mb() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "SecurityConfig::default_enable_encryption")]
    pub enableencryption: bool,
    #[serde(default)]
    pub masterkeyfile: Option<PathBuf>,
    #[serde(default)]
    pub masterkey: Option<String>,
}

impl SecurityConfig {
    fn default_enable_encryption() -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub databasepath: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "ThrottleConfig::default_min_delay_secs")]
    pub mindelaysecs: f64,
    #[serde(default = "ThrottleConfig::default_max_delay_secs")]
    pub maxdelaysecs: f64,
    #[serde(default = "ThrottleConfig::default_backoff_multiplier")]
    pub backoffmultiplier: f64,
}

impl ThrottleConfig {
    fn default_min_delay_secs() -> f64 {
        1.5
    }

    fn default_max_delay_secs() -> f64 {
        4.2
    }

    fn default_backoff_multiplier() -> f64 {
        1.5
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            mindelaysecs: Self::default_min_delay_secs(),
            maxdelaysecs: Self::default_max_delay_secs(),
            backoffmultiplier: Self::default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub discord: DiscordConfig,
    #[serde(default)]
    pub filesystem: FileSystemConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl AppConfig {
    /// Resolved path to the master key file: the configured value, or the
    /// platform data directory's `chatfs/master.key`.
    pub fn master_key_file(&self) -> PathBuf {
        self.security.masterkeyfile.clone().unwrap_or_else(|| data_dir().join("master.key"))
    }

    /// Resolved path to the SQLite index database.
    pub fn database_path(&self) -> PathBuf {
        self.index.databasepath.clone().unwrap_or_else(|| data_dir().join("index.sqlite3"))
    }
}

fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "chatfs")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Loads configuration from an optional TOML file, then layers
/// `CHATFS_*` environment variables over it. Missing required fields
/// (`Discord.BotToken`, `Discord.ChannelId`) surface as a single
/// `anyhow::Error` the caller reports and exits on.
pub fn load(config_file: Option<&Path>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();

    if let Some(path) = config_file {
        builder = builder.add_source(config::File::from(path));
    } else {
        // An optional default location; absence is not an error.
        builder = builder.add_source(config::File::with_name("chatfs").required(false));
    }

    builder = builder.add_source(config::Environment::with_prefix("CHATFS").separator("_").try_parsing(true));

    let raw = builder.build().context("failed to assemble configuration sources")?;

    raw.try_deserialize::<AppConfig>().context(
        "configuration is missing required fields (Discord.BotToken and Discord.ChannelId must be set)",
    )
}
