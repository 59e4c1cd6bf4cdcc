//! Shape of the daemon-wide `config.toml`. Per-process configuration
//! ([`crate::model::ProcessConfig`]) is never stored here — this file only
//! holds settings that apply to the daemon itself.

use serde::{Deserialize, Serialize};

pub mod prelude {
    pub use super::{DaemonConfig, LogConfig, WebConfig};
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default = "default_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub web: WebConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            health_check_interval_ms: default_check_interval_ms(),
            log: LogConfig::default(),
            web: WebConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_max_log_size")]
    pub max_size_bytes: u64,
    #[serde(default = "default_max_log_files")]
    pub max_files: u32,
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            max_size_bytes: default_max_log_size(),
            max_files: default_max_log_files(),
            ring_capacity: default_ring_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WebConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    pub username: Option<String>,
}

fn default_check_interval_ms() -> u64 {
    5000
}

fn default_max_log_size() -> u64 {
    10 * 1024 * 1024
}

fn default_max_log_files() -> u32 {
    5
}

fn default_ring_capacity() -> usize {
    1000
}

fn default_web_address() -> String {
    "127.0.0.1".to_string()
}

fn default_web_port() -> u16 {
    9876
}
