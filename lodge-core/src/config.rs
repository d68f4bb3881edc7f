//! Configuration loading for LODGE.
//!
//! Every section is optional in the TOML file; missing values fall back to
//! [`LodgeConfig::default`]. Unknown keys are rejected.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ConfigError;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LODGE_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LodgeConfig {
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub counters: CountersConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub stale_while_revalidate: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            stale_while_revalidate: true,
        }
    }
}

/// When a live collection keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPolicy {
    /// Poll on every interval regardless of push activity.
    #[default]
    Always,
    /// Stop polling once the push feed has delivered at least one event.
    UntilPushObserved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    pub push_debounce_ms: u64,
    /// Maximum items per collection fetch; `None` fetches everything.
    pub page_limit: Option<usize>,
    pub poll_policy: PollPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            push_debounce_ms: 300,
            page_limit: Some(50),
            poll_policy: PollPolicy::Always,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CountersConfig {
    pub refresh_interval_ms: u64,
    pub debounce_ms: u64,
    pub cache_ttl_ms: u64,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 30_000,
            debounce_ms: 300,
            cache_ttl_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `LODGE_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "lodge_sync=info,lodge_cache=info,warn".to_string(),
            json: false,
        }
    }
}

impl LodgeConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: LodgeConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.default_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.default_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        self.sync.validate()?;
        self.counters.validate()?;
        if self.telemetry.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "telemetry.filter",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

impl SyncConfig {
    /// Check the timing of one live collection. Refresh loops require a
    /// non-zero poll interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.poll_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.push_debounce_ms >= self.poll_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "sync.push_debounce_ms",
                reason: "must be < poll_interval_ms".to_string(),
            });
        }
        if self.page_limit == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "sync.page_limit",
                reason: "must be > 0 when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn push_debounce(&self) -> Duration {
        Duration::from_millis(self.push_debounce_ms)
    }
}

impl CountersConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "counters.refresh_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.debounce_ms >= self.refresh_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "counters.debounce_ms",
                reason: "must be < refresh_interval_ms".to_string(),
            });
        }
        if self.cache_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "counters.cache_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
