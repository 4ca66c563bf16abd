//! Configuration loading and constants.
//!
//! Loads application configuration from TOML files and defines the scheduler
//! defaults: poll cadence, batch sizing, stagger and cool-down intervals, and
//! the activity-check page size. `AppConfig` is the root configuration struct
//! used by the CLI host; `SchedulerConfig` is the part the library consumes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Scheduler Defaults
// =============================================================================

/// Interval between background poll cycles (30 seconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;

/// Delay before the warm-up cycle that runs right after `start()`
pub const DEFAULT_WARMUP_DELAY_MS: u64 = 2_000;

/// Number of background channels checked per cycle
pub const DEFAULT_BATCH_SIZE: usize = 3;

/// Pause between two channel checks inside one batch
pub const DEFAULT_STAGGER_DELAY_MS: u64 = 500;

/// Minimum time between two polls of the same channel
pub const DEFAULT_MIN_POLL_INTERVAL_MS: u64 = 60_000;

/// Number of recent messages fetched per activity check
pub const DEFAULT_ACTIVITY_PAGE_SIZE: usize = 3;

/// Only one channel may hold a full live subscription
pub const MAX_CONCURRENT_SUBSCRIPTIONS: usize = 1;

/// Partition holding a channel's primary data stream
pub const PRIMARY_PARTITION: u32 = 0;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default location of the persisted last-access state
pub const DEFAULT_STATE_PATH: &str = "lookout-state.json";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "lookout=debug";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Default spacing between simulated messages on a channel
pub const DEFAULT_MESSAGE_INTERVAL_SECS: u64 = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Scheduler tuning
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Persistence of last-access timestamps
    #[serde(default)]
    pub store: StoreConfig,
    /// Simulated channels served by the in-memory transport
    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tuning for the active/background scheduler
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Interval between poll cycles in milliseconds
    #[serde(default = "SchedulerConfig::default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Delay before the first cycle after start, in milliseconds
    #[serde(default = "SchedulerConfig::default_warmup_delay")]
    pub warmup_delay_ms: u64,
    /// Maximum channels checked per cycle
    #[serde(default = "SchedulerConfig::default_batch_size")]
    pub batch_size: usize,
    /// Pause between consecutive checks in a batch, in milliseconds
    #[serde(default = "SchedulerConfig::default_stagger_delay")]
    pub stagger_delay_ms: u64,
    /// Per-channel cool-down between polls, in milliseconds
    #[serde(default = "SchedulerConfig::default_min_poll_interval")]
    pub min_poll_interval_ms: u64,
    /// Maximum number of full subscriptions (must be 1)
    #[serde(default = "SchedulerConfig::default_max_concurrent_subscriptions")]
    pub max_concurrent_subscriptions: usize,
    /// Number of recent messages fetched per activity check
    #[serde(default = "SchedulerConfig::default_activity_page_size")]
    pub activity_page_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval(),
            warmup_delay_ms: Self::default_warmup_delay(),
            batch_size: Self::default_batch_size(),
            stagger_delay_ms: Self::default_stagger_delay(),
            min_poll_interval_ms: Self::default_min_poll_interval(),
            max_concurrent_subscriptions: Self::default_max_concurrent_subscriptions(),
            activity_page_size: Self::default_activity_page_size(),
        }
    }
}

impl SchedulerConfig {
    fn default_poll_interval() -> u64 {
        DEFAULT_POLL_INTERVAL_MS
    }
    fn default_warmup_delay() -> u64 {
        DEFAULT_WARMUP_DELAY_MS
    }
    fn default_batch_size() -> usize {
        DEFAULT_BATCH_SIZE
    }
    fn default_stagger_delay() -> u64 {
        DEFAULT_STAGGER_DELAY_MS
    }
    fn default_min_poll_interval() -> u64 {
        DEFAULT_MIN_POLL_INTERVAL_MS
    }
    fn default_max_concurrent_subscriptions() -> usize {
        MAX_CONCURRENT_SUBSCRIPTIONS
    }
    fn default_activity_page_size() -> usize {
        DEFAULT_ACTIVITY_PAGE_SIZE
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    /// Check values that would stall or break the scheduler
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_subscriptions != MAX_CONCURRENT_SUBSCRIPTIONS {
            return Err(ConfigError::Validation(format!(
                "max_concurrent_subscriptions is fixed at {}, got {}",
                MAX_CONCURRENT_SUBSCRIPTIONS, self.max_concurrent_subscriptions
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.activity_page_size == 0 {
            return Err(ConfigError::Validation(
                "activity_page_size must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a partial update, returning the merged config if it is valid.
    /// `self` is left untouched when validation fails.
    pub fn merged(&self, update: &ConfigUpdate) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = update.poll_interval_ms {
            next.poll_interval_ms = v;
        }
        if let Some(v) = update.warmup_delay_ms {
            next.warmup_delay_ms = v;
        }
        if let Some(v) = update.batch_size {
            next.batch_size = v;
        }
        if let Some(v) = update.stagger_delay_ms {
            next.stagger_delay_ms = v;
        }
        if let Some(v) = update.min_poll_interval_ms {
            next.min_poll_interval_ms = v;
        }
        if let Some(v) = update.max_concurrent_subscriptions {
            next.max_concurrent_subscriptions = v;
        }
        if let Some(v) = update.activity_page_size {
            next.activity_page_size = v;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial scheduler configuration accepted by `update_config`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigUpdate {
    pub poll_interval_ms: Option<u64>,
    pub warmup_delay_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub stagger_delay_ms: Option<u64>,
    pub min_poll_interval_ms: Option<u64>,
    pub max_concurrent_subscriptions: Option<usize>,
    pub activity_page_size: Option<usize>,
}

/// Persistence settings
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON file holding last-access timestamps and the last opened channel
    #[serde(default = "StoreConfig::default_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

impl StoreConfig {
    fn default_path() -> String {
        DEFAULT_STATE_PATH.to_string()
    }
}

/// A simulated channel for the CLI host
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Channel identifier
    pub id: String,
    /// Underlying stream id (defaults to the channel id)
    pub stream_id: Option<String>,
    /// Channel secret passed with subscribe and history requests
    pub secret: Option<String>,
    /// Seconds between generated messages (default: 20)
    pub message_interval_seconds: Option<u64>,
}

impl ChannelConfig {
    pub fn stream_id(&self) -> &str {
        self.stream_id.as_deref().unwrap_or(&self.id)
    }

    pub fn message_interval(&self) -> Duration {
        Duration::from_secs(
            self.message_interval_seconds
                .unwrap_or(DEFAULT_MESSAGE_INTERVAL_SECS)
                .max(1),
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;

        config.scheduler.validate()?;

        let mut seen = std::collections::HashSet::new();
        for channel in &config.channels {
            if channel.id.is_empty() {
                return Err(ConfigError::Validation(
                    "Channel id must not be empty".to_string(),
                ));
            }
            if !seen.insert(channel.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate channel id: {}",
                    channel.id
                )));
            }
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
