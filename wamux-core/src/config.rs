//! Configuration management for the fleet controller.
//!
//! Loads TOML configuration with support for multiple file locations,
//! environment variable overrides for deployment switches, and sensible
//! defaults for every knob.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;


/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        /// Path to the configuration file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as TOML.
    #[error("failed to parse config file '{path}': {source}")]
    ParseError {
        /// Path to the configuration file that could not be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        source: toml::de::Error,
    },

    /// An environment override carried an unusable value.
    #[error("invalid value for {var}: {value}")]
    InvalidOverride {
        /// The environment variable.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Which backend holds auth blobs. Session metadata is always relational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Embedded document store.
    Sled,
    /// Plain files under `sessions_dir` (shared with the web frontend).
    File,
}

impl StorageMode {
    /// Parse the `STORAGE_MODE` environment value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sled" => Some(StorageMode::Sled),
            "file" => Some(StorageMode::File),
            _ => None,
        }
    }
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct Config {
    /// Client-library driver.
    #[serde(default)]
    pub client: ClientConfig,

    /// Storage backends.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Fleet sizing and boot pacing.
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Message ingress knobs.
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Health monitoring intervals.
    #[serde(default)]
    pub health: HealthConfig,

    /// Batch operations (channel follow, broadcasts).
    #[serde(default)]
    pub batch: BatchConfig,

    /// Telegram bot settings.
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,

    /// Optional rolling-file logging.
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// Client-library driver configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientConfig {
    /// Driver name resolved by `client::create_factory`. The in-tree
    /// `"mock"` driver serves development and tests; deployments register
    /// a wire driver here.
    #[serde(default = "default_driver")]
    pub driver: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
        }
    }
}

fn default_driver() -> String {
    "mock".to_string()
}

/// Storage backend configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorageConfig {
    /// Auth blob backend. Overridden by `STORAGE_MODE`.
    #[serde(default = "default_storage_mode")]
    pub mode: StorageMode,

    /// SQLite URL for session metadata. Overridden by `DATABASE_URL`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Sled database directory (document mode).
    #[serde(default = "default_sled_path")]
    pub sled_path: String,

    /// Session credential directory (file mode).
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
}

/// Fleet sizing and boot pacing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FleetConfig {
    /// Hard cap on concurrently hosted sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Parallel rehydrations during startup.
    #[serde(default = "default_init_concurrency")]
    pub init_concurrency: usize,

    /// Milliseconds between session starts inside one startup batch.
    #[serde(default = "default_init_stagger_ms")]
    pub init_stagger_ms: u64,

    /// Milliseconds between startup batches.
    #[serde(default = "default_init_batch_delay_ms")]
    pub init_batch_delay_ms: u64,

    /// Route 515/516 through the complex restart path. Overridden by
    /// `ENABLE_515_FLOW`.
    #[serde(default)]
    pub enable_515_flow: bool,

    /// Privileged chat-bot user. Overridden by `DEFAULT_ADMIN_ID`.
    #[serde(default)]
    pub default_admin_id: Option<String>,
}

/// Message ingress knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngressConfig {
    /// Prefix for users without a persisted preference.
    #[serde(default = "default_prefix")]
    pub default_prefix: String,

    /// Seconds added to every message timestamp that arrives without one,
    /// or to correct a known wire-clock skew. Default 0.
    #[serde(default)]
    pub timestamp_offset_secs: i64,

    /// Cross-session dedup entry lifetime.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
}

/// Health monitoring intervals.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthConfig {
    /// Per-session inactivity probe cadence.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Full-registry sweep cadence.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Inactivity span that triggers a self-ping.
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,

    /// How long a self-ping waits for evidence of life.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Failed self-pings before local monitoring gives up.
    #[serde(default = "default_max_failed_pings")]
    pub max_failed_pings: u32,
}

/// Batch operations configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchConfig {
    /// Newsletter to auto-follow after each connect. Overridden by
    /// `WHATSAPP_CHANNEL_JID`; empty disables the feature.
    #[serde(default)]
    pub channel_jid: Option<String>,

    /// Broadcast source file, truncated after a successful sweep.
    #[serde(default = "default_announcement_path")]
    pub announcement_path: String,

    /// Seconds between broadcast sweeps.
    #[serde(default = "default_broadcast_interval_secs")]
    pub broadcast_interval_secs: u64,

    /// Pin the own-JID chat after delivering a broadcast.
    #[serde(default)]
    pub pin_after_broadcast: bool,
}

/// Telegram bot settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct TelegramConfig {
    /// Bot token. `TELEGRAM_BOT_TOKEN` takes priority; never logged.
    #[serde(default)]
    pub token: Option<String>,
}

/// Rolling-file logging configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Log directory.
    pub directory: String,

    /// Rotation: `daily`, `hourly`, or `never`.
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Rotated files kept on disk.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_storage_mode() -> StorageMode {
    StorageMode::Sled
}

fn default_database_url() -> String {
    "sqlite:data/wamux.db".to_string()
}

fn default_sled_path() -> String {
    "data/auth".to_string()
}

fn default_sessions_dir() -> String {
    "sessions".to_string()
}

fn default_max_sessions() -> usize {
    200
}

fn default_init_concurrency() -> usize {
    3
}

fn default_init_stagger_ms() -> u64 {
    800
}

fn default_init_batch_delay_ms() -> u64 {
    1500
}

fn default_prefix() -> String {
    ".".to_string()
}

fn default_dedup_ttl_secs() -> u64 {
    120
}

fn default_probe_interval_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_inactivity_threshold_secs() -> u64 {
    1800
}

fn default_ping_timeout_secs() -> u64 {
    15
}

fn default_max_failed_pings() -> u32 {
    3
}

fn default_announcement_path() -> String {
    "announcement.txt".to_string()
}

fn default_broadcast_interval_secs() -> u64 {
    300
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: default_storage_mode(),
            database_url: default_database_url(),
            sled_path: default_sled_path(),
            sessions_dir: default_sessions_dir(),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            init_concurrency: default_init_concurrency(),
            init_stagger_ms: default_init_stagger_ms(),
            init_batch_delay_ms: default_init_batch_delay_ms(),
            enable_515_flow: false,
            default_admin_id: None,
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            default_prefix: default_prefix(),
            timestamp_offset_secs: 0,
            dedup_ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            max_failed_pings: default_max_failed_pings(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            channel_jid: None,
            announcement_path: default_announcement_path(),
            broadcast_interval_secs: default_broadcast_interval_secs(),
            pin_after_broadcast: false,
        }
    }
}

impl Config {
    /// Load configuration from file system.
    ///
    /// Priority order:
    /// 1. `path` argument (CLI `--config`)
    /// 2. WAMUX_CONFIG environment variable
    /// 3. ./wamux.toml (local directory)
    /// 4. ~/.config/wamux/wamux.toml (user config)
    ///
    /// Returns default config if no config file found. Environment
    /// overrides are applied in every case.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IoError`] if a found file cannot be read.
    /// Returns [`ConfigError::ParseError`] if a found file is not valid TOML.
    /// Returns [`ConfigError::InvalidOverride`] for malformed env values.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn load_file(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            return Self::load_from(p);
        }

        if let Ok(path) = std::env::var("WAMUX_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                return Self::load_from(p);
            }
        }

        let local = PathBuf::from("wamux.toml");
        if local.exists() {
            return Self::load_from(local);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config/wamux/wamux.toml");
            if user_config.exists() {
                return Self::load_from(user_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IoError`] if the file cannot be read.
    /// Returns [`ConfigError::ParseError`] if the file is not valid TOML.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply deployment-switch environment overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(mode) = std::env::var("STORAGE_MODE")
            && !mode.is_empty()
        {
            self.storage.mode = StorageMode::parse(&mode).ok_or(ConfigError::InvalidOverride {
                var: "STORAGE_MODE",
                value: mode,
            })?;
        }

        if let Ok(url) = std::env::var("DATABASE_URL")
            && !url.is_empty()
        {
            self.storage.database_url = url;
        }

        if let Ok(flag) = std::env::var("ENABLE_515_FLOW")
            && !flag.is_empty()
        {
            self.fleet.enable_515_flow = match flag.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        var: "ENABLE_515_FLOW",
                        value: flag,
                    });
                }
            };
        }

        if let Ok(jid) = std::env::var("WHATSAPP_CHANNEL_JID")
            && !jid.is_empty()
        {
            self.batch.channel_jid = Some(jid);
        }

        if let Ok(admin) = std::env::var("DEFAULT_ADMIN_ID")
            && !admin.is_empty()
        {
            self.fleet.default_admin_id = Some(admin);
        }

        Ok(())
    }
}
