use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use satlink_common::GpsFix;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "agent.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Coordination endpoint, e.g. `ws://ground:8080/ws`
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Stable across restarts, usually the board's MAC address
    #[serde(default = "default_unit_id")]
    pub unit_id: String,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_telemetry_interval_secs")]
    pub telemetry_interval_secs: u64,

    /// 0 disables polling while tracking
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// Selected on the first connection, before any operator choice arrives
    #[serde(default)]
    pub satellite: Option<String>,

    /// Reported with every pointing result
    #[serde(default)]
    pub gps: Option<GpsFix>,

    /// Smallest azimuth error worth moving the rotator for
    #[serde(default = "default_pointing_threshold_deg")]
    pub pointing_threshold_deg: f64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

fn default_unit_id() -> String {
    "FU1".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_telemetry_interval_secs() -> u64 {
    5
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_reconnect_interval_secs() -> u64 {
    3
}

fn default_pointing_threshold_deg() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            unit_id: default_unit_id(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            telemetry_interval_secs: default_telemetry_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            satellite: None,
            gps: None,
            pointing_threshold_deg: default_pointing_threshold_deg(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        if config.unit_id.trim().is_empty() {
            anyhow::bail!("unit_id must not be empty");
        }
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }
}

pub static CONFIG: OnceLock<AgentConfig> = OnceLock::new();

pub fn read_config(path: &str) -> anyhow::Result<&'static AgentConfig> {
    let config = if std::path::Path::new(path).exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path))?;
        AgentConfig::from_toml(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path))?
    } else {
        tracing::warn!("Config file {} not found, using defaults", path);
        AgentConfig::default()
    };

    Ok(CONFIG.get_or_init(|| config))
}
