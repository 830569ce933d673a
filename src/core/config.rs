use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::errors::{OrchestratorError, Result};
use crate::platform::{NativePlatform, Platform};

pub const CONFIG_FILE: &str = "orchestrator.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub robots: RobotsConfig,
    pub triggers: TriggersConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token for `/api/*`. Unset means loopback-only access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Bearer token robots present on the WebSocket upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_token: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    17900
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_token: None,
            robot_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_backend")]
    pub backend: QueueBackendKind,
    /// SQLite file holding durable jobs and trigger configs.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_backend() -> QueueBackendKind {
    QueueBackendKind::Memory
}

fn default_sqlite_path() -> PathBuf {
    NativePlatform::data_dir().join("queue.db")
}

fn default_max_pending() -> usize {
    10_000
}

fn default_history_limit() -> usize {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            max_pending: default_max_pending(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicyKind {
    LeastLoaded,
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_placement_policy")]
    pub placement_policy: PlacementPolicyKind,
    #[serde(default = "default_reject_cooldown_secs")]
    pub reject_cooldown_secs: u64,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub default_max_retries: u32,
}

fn default_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    10
}

fn default_placement_policy() -> PlacementPolicyKind {
    PlacementPolicyKind::LeastLoaded
}

fn default_reject_cooldown_secs() -> u64 {
    60
}

fn default_retry_backoff_base_ms() -> u64 {
    1000
}

fn default_retry_backoff_max_ms() -> u64 {
    60_000
}

fn default_timeout_secs() -> u64 {
    3600
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
            placement_policy: default_placement_policy(),
            reject_cooldown_secs: default_reject_cooldown_secs(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotsConfig {
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_removal_after_secs")]
    pub removal_after_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_removal_after_secs() -> u64 {
    300
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            removal_after_secs: default_removal_after_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersConfig {
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,
}

fn default_workflows_dir() -> PathBuf {
    NativePlatform::data_dir().join("workflows")
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl OrchestratorConfig {
    pub fn default_path() -> PathBuf {
        NativePlatform::data_dir().join(CONFIG_FILE)
    }

    /// Loads `path`, or the default location when `None`. A missing file yields defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };
        if !path.exists() {
            info!(path = %path.display(), "No config file found, using defaults");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            OrchestratorError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        info!(
            path = %path.display(),
            backend = ?config.queue.backend,
            policy = ?config.dispatch.placement_policy,
            "Loaded orchestrator config"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: OrchestratorConfig = toml::from_str(content)
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.dispatch.interval_ms == 0 || self.robots.sweep_interval_ms == 0 {
            return Err(OrchestratorError::Configuration(
                "dispatch.interval_ms and robots.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.dispatch.batch_size == 0 {
            return Err(OrchestratorError::Configuration(
                "dispatch.batch_size must be at least 1".to_string(),
            ));
        }
        if self.robots.removal_after_secs < self.robots.heartbeat_timeout_secs {
            return Err(OrchestratorError::Configuration(
                "robots.removal_after_secs must not be shorter than heartbeat_timeout_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| OrchestratorError::Configuration(e.to_string()))
    }

    /// Address operators and the CLI use to reach the daemon.
    pub fn api_base_url(&self) -> String {
        let host = match self.server.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = OrchestratorConfig::parse("").unwrap();
        assert_eq!(config.server.port, 17900);
        assert_eq!(config.queue.backend, QueueBackendKind::Memory);
        assert_eq!(config.dispatch.placement_policy, PlacementPolicyKind::LeastLoaded);
        assert_eq!(config.dispatch.interval_ms, 500);
        assert_eq!(config.robots.heartbeat_timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = OrchestratorConfig::parse(
            r#"
            [queue]
            backend = "sqlite"
            sqlite_path = "/tmp/q.db"

            [dispatch]
            placement_policy = "round_robin"
            batch_size = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.backend, QueueBackendKind::Sqlite);
        assert_eq!(config.queue.sqlite_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.queue.max_pending, 10_000);
        assert_eq!(config.dispatch.placement_policy, PlacementPolicyKind::RoundRobin);
        assert_eq!(config.dispatch.batch_size, 3);
        assert_eq!(config.dispatch.reject_cooldown_secs, 60);
    }

    #[test]
    fn unknown_policy_or_backend_is_a_configuration_error() {
        let err = OrchestratorConfig::parse("[dispatch]\nplacement_policy = \"random\"\n")
            .unwrap_err();
        assert_eq!(err.error_type(), "ConfigurationError");
        let err = OrchestratorConfig::parse("[queue]\nbackend = \"redis\"\n").unwrap_err();
        assert_eq!(err.error_type(), "ConfigurationError");
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(OrchestratorConfig::parse("[dispatch]\nbatch_size = 0\n").is_err());
    }

    #[test]
    fn default_config_renders_and_reparses() {
        let config = OrchestratorConfig::default();
        let rendered = config.to_toml().unwrap();
        let back = OrchestratorConfig::parse(&rendered).unwrap();
        assert_eq!(back.server.port, config.server.port);
        assert_eq!(back.queue.sqlite_path, config.queue.sqlite_path);
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(Some(&dir.path().join("nope.toml")))
            .await
            .unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn wildcard_host_maps_to_loopback_for_clients() {
        let mut config = OrchestratorConfig::default();
        config.server.host = "0.0.0.0".to_string();
        assert_eq!(config.api_base_url(), "http://127.0.0.1:17900");
    }
}
