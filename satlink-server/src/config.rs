use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use satlink_common::Observer;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// UDP port for best-effort presence datagrams
    #[serde(default = "default_presence_port")]
    pub presence_port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,

    /// Registry snapshot and schedule/assignment artifacts live here
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// TLE catalog, `{ "NOAA 15": { "line1": ..., "line2": ... } }`
    #[serde(default = "default_tle_file")]
    pub tle_file: String,

    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,

    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    #[serde(default = "default_stream_interval_secs")]
    pub stream_interval_secs: u64,

    #[serde(default = "default_planning_interval_minutes")]
    pub planning_interval_minutes: u64,

    #[serde(default)]
    pub observer: Observer,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_satellites")]
    pub satellites: Vec<String>,

    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: u64,

    #[serde(default = "default_sample_step_minutes")]
    pub sample_step_minutes: u64,

    #[serde(default = "default_pass_duration_secs")]
    pub pass_duration_secs: i64,

    #[serde(default = "default_min_elevation_deg")]
    pub min_elevation_deg: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_presence_port() -> u16 {
    8081
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_retention_days() -> u64 {
    3
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_tle_file() -> String {
    "data/satellites.json".to_string()
}

fn default_liveness_timeout_secs() -> u64 {
    300
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_stream_interval_secs() -> u64 {
    5
}

fn default_planning_interval_minutes() -> u64 {
    60
}

fn default_satellites() -> Vec<String> {
    vec!["NOAA 15".to_string(), "NOAA 19".to_string()]
}

fn default_horizon_hours() -> u64 {
    24
}

fn default_sample_step_minutes() -> u64 {
    15
}

fn default_pass_duration_secs() -> i64 {
    600
}

fn default_min_elevation_deg() -> f64 {
    10.0
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            satellites: default_satellites(),
            horizon_hours: default_horizon_hours(),
            sample_step_minutes: default_sample_step_minutes(),
            pass_duration_secs: default_pass_duration_secs(),
            min_elevation_deg: default_min_elevation_deg(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            presence_port: default_presence_port(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            log_retention_days: default_log_retention_days(),
            data_dir: default_data_dir(),
            tle_file: default_tle_file(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            stream_interval_secs: default_stream_interval_secs(),
            planning_interval_minutes: default_planning_interval_minutes(),
            observer: Observer::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file '{}'", path))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn presence_address(&self) -> String {
        format!("{}:{}", self.host, self.presence_port)
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn liveness_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_timeout_secs.min(MAX_LIVENESS_TIMEOUT_SECS) as i64)
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_secs(self.stream_interval_secs.max(1))
    }
}

/// Upper bounds applied when config values become time spans
pub const MAX_LIVENESS_TIMEOUT_SECS: u64 = 7 * 24 * 3600;
pub const MAX_HORIZON_HOURS: u64 = 31 * 24;
pub const MAX_SAMPLE_STEP_MINUTES: u64 = 24 * 60;

pub static CONFIG: OnceLock<ServerConfig> = OnceLock::new();

/// Load the config file once for the whole process. A missing file falls
/// back to defaults; a malformed one is an error.
pub fn read_config(path: &str) -> anyhow::Result<&'static ServerConfig> {
    let config = if std::path::Path::new(path).exists() {
        ServerConfig::from_file(path)?
    } else {
        tracing::warn!("Config file {} not found, using defaults", path);
        ServerConfig::default()
    };

    Ok(CONFIG.get_or_init(|| config))
}
