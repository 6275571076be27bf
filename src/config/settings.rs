use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Process-level settings read from TOML. Everything here has a default, so
/// an empty file (or no file at all) is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub gateway: GatewaySettings,
    pub logging: LoggingConfig,
    pub health: HealthConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub stats: StatsConfig,
}

/// 管理接口监听地址
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 12300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// JSON document holding providers and protocol listeners
    pub config_path: String,
    /// host the per-dialect listeners bind to
    pub listen_host: String,
    pub max_body_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            config_path: "data/gateway_config.json".to_string(),
            listen_host: "127.0.0.1".to_string(),
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub database_path: String,
    pub persist_requests: bool,
    /// entries waiting for SQLite; overflow is dropped with a warning
    pub archive_queue: usize,
    /// tracing filter used when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            database_path: "data/gateway.db".to_string(),
            persist_requests: true,
            archive_queue: 4096,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    /// double the cooldown on each failed half-open probe
    pub relapse_backoff: bool,
    pub max_cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
            relapse_backoff: false,
            max_cooldown_secs: 600,
        }
    }
}

impl HealthConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs.max(self.cooldown_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// used when a provider has no timeout_secs of its own
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub max_entry_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
            ttl_secs: 3600,
            max_entry_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub recent_capacity: usize,
    pub latency_window: usize,
    pub hourly_snapshot_hours: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            recent_capacity: 50,
            latency_window: 100,
            hourly_snapshot_hours: 24,
        }
    }
}

impl Settings {
    /// Loads settings from `GATEWAY_SETTINGS`, `custom-config.toml` or
    /// `config.toml`, in that order. No file means defaults.
    pub fn load() -> Result<Self> {
        match Self::find_config_file() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::warn!(
                    "No settings file found (custom-config.toml / config.toml), using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health.failure_threshold == 0 {
            return Err(GatewayError::Config(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(GatewayError::Config(
                "upstream.timeout_secs must be positive".into(),
            ));
        }
        if self.stats.latency_window == 0 || self.stats.recent_capacity == 0 {
            return Err(GatewayError::Config(
                "stats windows must be positive".into(),
            ));
        }
        if self.logging.archive_queue == 0 {
            return Err(GatewayError::Config(
                "logging.archive_queue must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        if let Ok(path) = std::env::var("GATEWAY_SETTINGS")
            && !path.trim().is_empty()
        {
            return Some(path);
        }

        let possible_names = ["custom-config.toml", "config.toml"];
        possible_names
            .iter()
            .find(|name| Path::new(name).exists())
            .map(|name| name.to_string())
    }
}
