//! Broker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Max serialized payload size in bytes (1MB default)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Default request timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// Retain a bounded send history for diagnostics
    #[serde(default)]
    pub enable_logging: bool,

    /// Buffer channel messages and replay them to joiners
    #[serde(default = "default_enable_replay")]
    pub enable_replay: bool,

    /// Per-channel history capacity; also the replay bound on join
    #[serde(default = "default_replay_buffer_size")]
    pub replay_buffer_size: usize,
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_enable_replay() -> bool {
    true
}

fn default_replay_buffer_size() -> usize {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            message_timeout_ms: default_message_timeout_ms(),
            enable_logging: false,
            enable_replay: default_enable_replay(),
            replay_buffer_size: default_replay_buffer_size(),
        }
    }
}

impl BrokerConfig {
    /// Get the default request timeout as a Duration
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// Effective channel history capacity; zero disables buffering
    pub fn history_capacity(&self) -> usize {
        if self.enable_replay { self.replay_buffer_size } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert_eq!(config.message_timeout_ms, 30_000);
        assert!(!config.enable_logging);
        assert!(config.enable_replay);
        assert_eq!(config.replay_buffer_size, 10);
    }

    #[test]
    fn test_message_timeout_duration() {
        let config = BrokerConfig {
            message_timeout_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.message_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_history_capacity_respects_replay_flag() {
        let config = BrokerConfig {
            enable_replay: false,
            replay_buffer_size: 50,
            ..Default::default()
        };
        assert_eq!(config.history_capacity(), 0);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: BrokerConfig = serde_json::from_str(r#"{"max_message_size": 4096}"#).unwrap();
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.message_timeout_ms, 30_000);
        assert!(config.enable_replay);
    }
}
