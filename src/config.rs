// src/config.rs

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::warn;

use crate::plugin::PluginKind;
use crate::scan::ScanConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Key/value source for hub settings. Backed by the environment in
/// production and by a map in tests.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
}

/// Reads from process environment variables; `set` is a process-local
/// override.
#[derive(Default)]
pub struct EnvConfigManager;

impl EnvConfigManager {
    /// Load a dotenv file first so its values are visible as env vars.
    pub fn with_env_file(path: Option<&std::path::Path>) -> Self {
        match path {
            Some(path) => {
                if let Err(err) = dotenvy::from_path(path) {
                    warn!(path = %path.display(), %err, "could not load env file");
                }
            }
            None => {
                // Optional; absence is normal outside development.
                let _ = dotenvy::dotenv();
            }
        }
        Self
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }

    async fn set(&self, key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) };
    }
}

/// In-memory source for tests and embedding.
#[derive(Default)]
pub struct MapConfigManager {
    values: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(pairs: &[(&str, &str)]) -> Self {
        let manager = Self::new();
        for (k, v) in pairs {
            manager.values.insert(k.to_string(), v.to_string());
        }
        manager
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

/// Fully resolved hub settings. `load` applies defaults and validates the
/// few values with typed meanings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub serial_no: String,
    pub server_url: String,
    pub app_id: String,
    pub app_secret: String,
    pub http_timeout: Duration,
    /// Hub loop period between heartbeats.
    pub loop_period: Duration,
    /// Heartbeats between flow refreshes.
    pub flow_refresh_cycles: u32,
    pub auto_scan: bool,
    /// Reported to the backend at startup for weather-aware flows.
    pub latitude: f64,
    pub longitude: f64,
    pub plugins: Vec<PluginKind>,
    pub scan: ScanConfig,
}

impl HubSettings {
    pub async fn load(config: &dyn ConfigManagerType) -> Result<Self, ConfigError> {
        let serial_no = config
            .get("HUB_SERIAL_NO")
            .await
            .ok_or(ConfigError::Missing("HUB_SERIAL_NO"))?;
        let server_url = config
            .get("HUB_SERVER_URL")
            .await
            .ok_or(ConfigError::Missing("HUB_SERVER_URL"))?;
        let app_id = config
            .get("HUB_APP_ID")
            .await
            .ok_or(ConfigError::Missing("HUB_APP_ID"))?;
        let app_secret = config
            .get("HUB_APP_SECRET")
            .await
            .ok_or(ConfigError::Missing("HUB_APP_SECRET"))?;

        let http_timeout =
            Duration::from_secs(parse_or(config, "HUB_HTTP_TIMEOUT_SECS", 15).await?);
        let loop_period = Duration::from_secs(parse_or(config, "HUB_LOOP_PERIOD_SECS", 10).await?);
        let flow_refresh_cycles = parse_or(config, "HUB_FLOW_REFRESH_CYCLES", 30).await? as u32;
        let auto_scan = matches!(
            config.get("HUB_AUTO_SCAN").await.as_deref(),
            Some("1") | Some("true") | Some("yes") | None
        );
        let latitude = parse_f64_or(config, "HUB_LATITUDE", 0.0).await?;
        let longitude = parse_f64_or(config, "HUB_LONGITUDE", 0.0).await?;

        let plugins = match config.get("HUB_PLUGINS").await {
            Some(raw) => {
                let mut kinds = Vec::new();
                for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    match PluginKind::from_name(name) {
                        Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
                        Some(_) => {}
                        None => {
                            return Err(ConfigError::Invalid {
                                key: "HUB_PLUGINS",
                                value: name.to_string(),
                            });
                        }
                    }
                }
                kinds
            }
            None => vec![PluginKind::Emulator],
        };

        let scan = ScanConfig {
            scan_duration: Duration::from_secs(
                parse_or(config, "HUB_SCAN_DURATION_SECS", 5).await?,
            ),
            pause_duration: Duration::from_secs(parse_or(config, "HUB_SCAN_PAUSE_SECS", 1).await?),
            failure_threshold: parse_or(config, "HUB_SCAN_FAILURE_THRESHOLD", 3).await? as u32,
            recovery_delay: Duration::from_secs(
                parse_or(config, "HUB_SCAN_RECOVERY_SECS", 10).await?,
            ),
            preventive_reset_threshold: parse_or(config, "HUB_SCAN_PREVENTIVE_RESET", 120).await?
                as u32,
        };

        Ok(Self {
            serial_no,
            server_url,
            app_id,
            app_secret,
            http_timeout,
            loop_period,
            flow_refresh_cycles,
            auto_scan,
            latitude,
            longitude,
            plugins,
            scan,
        })
    }

    pub fn needs_radio(&self) -> bool {
        self.plugins.iter().any(|p| p.needs_radio())
    }
}

async fn parse_f64_or(
    config: &dyn ConfigManagerType,
    key: &'static str,
    default: f64,
) -> Result<f64, ConfigError> {
    match config.get(key).await {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

async fn parse_or(
    config: &dyn ConfigManagerType,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match config.get(key).await {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}
