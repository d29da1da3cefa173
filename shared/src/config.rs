use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::path::Path;

/// Environment variable naming the config file path.
pub const CONFIG_PATH_ENV: &str = "NMS_CONFIG";
/// Secret overrides; these win over anything in the file.
pub const DATABASE_URL_ENV: &str = "NMS_DATABASE_URL";
pub const ENCRYPTION_KEY_ENV: &str = "NMS_ENCRYPTION_KEY";
pub const JWT_SECRET_ENV: &str = "NMS_JWT_SECRET";

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Top-level server configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ping: PingConfig,
    #[serde(default)]
    pub plugins: PluginConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_jwt_ttl_minutes")]
    pub jwt_ttl_minutes: i64,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    #[serde(default)]
    pub admin_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    /// Cap for the pool serving the entity service and metric queries.
    #[serde(default = "default_read_max_connections")]
    pub read_max_connections: u32,
    /// Cap for the pool owned by the metrics writer. Isolated from the read
    /// pool so bulk ingestion cannot starve API reads.
    #[serde(default = "default_write_max_connections")]
    pub write_max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CryptoConfig {
    /// Base64-encoded 256-bit key for credential payloads.
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// When true (the default), a device update reschedules the device with
    /// deadline = now so the change takes effect on the next tick. When
    /// false the existing deadline is preserved.
    #[serde(default = "default_true")]
    pub reschedule_on_update: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingConfig {
    #[serde(default = "default_ping_binary")]
    pub binary: String,
    #[serde(default = "default_ping_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_ping_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_plugin_directory")]
    pub directory: String,
    #[serde(default = "default_poll_workers")]
    pub poll_workers: usize,
    #[serde(default = "default_discovery_workers")]
    pub discovery_workers: usize,
    /// Bounded job buffer per pool; submission blocks when full.
    #[serde(default = "default_job_buffer")]
    pub job_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_health_threshold")]
    pub threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Default query lookback when no start timestamp is supplied.
    #[serde(default = "default_metrics_lookback_seconds")]
    pub lookback_seconds: i64,
    #[serde(default = "default_metrics_limit")]
    pub default_limit: i64,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_jwt_ttl_minutes() -> i64 {
    60
}
fn default_admin_username() -> String {
    "admin".to_string()
}
fn default_read_max_connections() -> u32 {
    10
}
fn default_write_max_connections() -> u32 {
    5
}
fn default_tick_seconds() -> u64 {
    5
}
fn default_true() -> bool {
    true
}
fn default_ping_binary() -> String {
    "fping".to_string()
}
fn default_ping_timeout_ms() -> u64 {
    500
}
fn default_ping_retries() -> u32 {
    2
}
fn default_plugin_directory() -> String {
    "plugins".to_string()
}
fn default_poll_workers() -> usize {
    5
}
fn default_discovery_workers() -> usize {
    2
}
fn default_job_buffer() -> usize {
    50
}
fn default_health_window_seconds() -> u64 {
    60
}
fn default_health_threshold() -> u32 {
    3
}
fn default_metrics_lookback_seconds() -> i64 {
    3600
}
fn default_metrics_limit() -> i64 {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: default_bind_address(),
            jwt_secret: String::new(),
            jwt_ttl_minutes: default_jwt_ttl_minutes(),
            admin_username: default_admin_username(),
            admin_password: String::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: String::new(),
            read_max_connections: default_read_max_connections(),
            write_max_connections: default_write_max_connections(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_seconds: default_tick_seconds(),
            reschedule_on_update: true,
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            binary: default_ping_binary(),
            timeout_ms: default_ping_timeout_ms(),
            retries: default_ping_retries(),
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig {
            directory: default_plugin_directory(),
            poll_workers: default_poll_workers(),
            discovery_workers: default_discovery_workers(),
            job_buffer: default_job_buffer(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            window_seconds: default_health_window_seconds(),
            threshold: default_health_threshold(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            lookback_seconds: default_metrics_lookback_seconds(),
            default_limit: default_metrics_limit(),
        }
    }
}

impl Config {
    /// Loads the file named by `NMS_CONFIG` (default `config.yaml`), then
    /// applies environment overrides for secrets. A missing file yields the
    /// defaults, which is enough for local runs with env vars only.
    pub fn load() -> anyhow::Result<Config> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path))?;
            Config::from_yaml(&raw)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Config> {
        serde_yaml::from_str(raw).context("failed to parse config file")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var(DATABASE_URL_ENV) {
            self.database.url = url;
        }
        if let Ok(key) = env::var(ENCRYPTION_KEY_ENV) {
            self.crypto.key = key;
        }
        if let Ok(secret) = env::var(JWT_SECRET_ENV) {
            self.server.jwt_secret = secret;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.database.url.is_empty(),
            "database.url is required (or set {})",
            DATABASE_URL_ENV
        );
        anyhow::ensure!(
            !self.crypto.key.is_empty(),
            "crypto.key is required (or set {})",
            ENCRYPTION_KEY_ENV
        );
        anyhow::ensure!(self.scheduler.tick_seconds >= 1, "scheduler.tick_seconds must be >= 1");
        anyhow::ensure!(self.health.threshold >= 1, "health.threshold must be >= 1");
        anyhow::ensure!(self.plugins.poll_workers >= 1, "plugins.poll_workers must be >= 1");
        anyhow::ensure!(
            self.plugins.discovery_workers >= 1,
            "plugins.discovery_workers must be >= 1"
        );
        Ok(())
    }
}
