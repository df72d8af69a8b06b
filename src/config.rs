//! Configuration management for the daemon.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the history capacity is budgeted across topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapacityScope {
    /// One budget for all topics combined. A busy topic can evict a quiet one.
    #[default]
    Shared,
    /// Every topic gets its own budget.
    PerTopic,
}

/// Main configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host to bind to
    pub host: String,

    /// HTTP port for the web server
    pub http_port: u16,

    /// Log level
    pub log_level: String,

    /// Topic used when a client does not select one
    pub default_topic: String,

    /// Maximum number of events retained for replay
    pub history_capacity: usize,

    /// Whether `history_capacity` is shared or per topic
    pub capacity_scope: CapacityScope,

    /// Message ids below this bound are synthesized before heartbeats start
    pub message_count: u64,

    /// Delay between synthesized messages
    pub message_interval_ms: u64,

    /// Delay between heartbeats
    pub heartbeat_interval_ms: u64,

    /// Steps emitted by each run
    pub run_steps: u32,

    /// Delay between run steps
    pub run_step_interval_ms: u64,

    /// Bound of each connection's outbound queue
    pub outbound_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 8765,
            log_level: "info".to_string(),
            default_topic: "default".to_string(),
            history_capacity: 200,
            capacity_scope: CapacityScope::Shared,
            message_count: 5,
            message_interval_ms: 1000,
            heartbeat_interval_ms: 5000,
            run_steps: 5,
            run_step_interval_ms: 1000,
            outbound_queue: 64,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("stream-relay")
            .join("config.json")
    }

    /// Load configuration from a file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            message_count: self.message_count,
            message_interval: Duration::from_millis(self.message_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            run_steps: self.run_steps,
            run_step_interval: Duration::from_millis(self.run_step_interval_ms),
        }
    }
}

/// Timing knobs shared by every producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub message_count: u64,
    pub message_interval: Duration,
    pub heartbeat_interval: Duration,
    pub run_steps: u32,
    pub run_step_interval: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Config::default().pacing()
    }
}
