// Configuration for the sync engine.
// Loaded from TOML; every field has a default so a partial file is enough.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::SyncError;

/// Environment variable pointing at a config file.
pub const CONFIG_ENV: &str = "CRM_SYNC_CONFIG";

/// Default freshness window for cached queries: 30 seconds.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Default retention for unobserved entries: 5 minutes.
pub const DEFAULT_EVICT_AFTER: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh-token";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub refresh_path: String,
    pub request_timeout_ms: u64,
    pub stale_after_ms: u64,
    pub evict_after_ms: u64,
    pub gc_interval_ms: u64,
    /// First delay between reachability checks while offline; doubles up to the max.
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Where the access token is persisted. Falls back to the platform cache dir.
    pub token_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout_ms: 30_000,
            stale_after_ms: DEFAULT_STALE_AFTER.as_millis() as u64,
            evict_after_ms: DEFAULT_EVICT_AFTER.as_millis() as u64,
            gc_interval_ms: 60_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            token_path: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl SyncConfig {
    /// Load from `CRM_SYNC_CONFIG` if set, otherwise use defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.refresh_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "refresh_path",
                reason: "must start with '/'".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.evict_after_ms < self.stale_after_ms {
            return Err(ConfigError::InvalidValue {
                field: "evict_after_ms",
                reason: "must be >= stale_after_ms".to_string(),
            });
        }
        if self.gc_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "gc_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect_initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect_initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect_max_ms",
                reason: "must be >= reconnect_initial_ms".to_string(),
            });
        }
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn evict_after(&self) -> Duration {
        Duration::from_millis(self.evict_after_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
