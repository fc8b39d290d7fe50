//! Configuration: every default named in the protocol's external interfaces
//! table, collected into one struct. Loads from JSON strings; file IO is
//! left to the host application.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by `Server` and `Client`. All fields have the protocol's
/// documented defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiptideConfig {
    /// Maximum user payload size, in bytes, after the header.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    /// Client heartbeat cadence, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence duration before a connection times out, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum connection attempts before `ConnectionFailed`.
    #[serde(default = "default_max_connection_attempts")]
    pub max_connection_attempts: u32,
    /// Maximum reliable send attempts before a pending message is dropped.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// Multiplier applied to the smoothed RTT to compute the retry timer.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    /// Maximum simultaneously connected clients (server only).
    #[serde(default = "default_max_client_count")]
    pub max_client_count: u32,
    /// Whether the quality-based disconnect (`PoorConnection`) is enabled.
    #[serde(default = "default_quality_disconnect_enabled")]
    pub quality_disconnect_enabled: bool,
}

fn default_max_payload_size() -> usize {
    crate::message::MAX_PAYLOAD_SIZE
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_max_connection_attempts() -> u32 {
    5
}
fn default_max_send_attempts() -> u32 {
    15
}
fn default_retry_multiplier() -> f64 {
    1.2
}
fn default_max_client_count() -> u32 {
    64
}
fn default_quality_disconnect_enabled() -> bool {
    true
}

impl Default for RiptideConfig {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload_size(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_timeout_ms(),
            max_connection_attempts: default_max_connection_attempts(),
            max_send_attempts: default_max_send_attempts(),
            retry_multiplier: default_retry_multiplier(),
            max_client_count: default_max_client_count(),
            quality_disconnect_enabled: default_quality_disconnect_enabled(),
        }
    }
}

impl RiptideConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_table() {
        let cfg = RiptideConfig::default();
        assert_eq!(cfg.max_payload_size, 1225);
        assert_eq!(cfg.heartbeat_interval_ms, 1000);
        assert_eq!(cfg.timeout_ms, 5000);
        assert_eq!(cfg.max_connection_attempts, 5);
        assert_eq!(cfg.max_send_attempts, 15);
        assert_eq!(cfg.retry_multiplier, 1.2);
        assert!(cfg.max_client_count <= 65_534);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg = RiptideConfig::from_json_str(r#"{"max_client_count": 4}"#).unwrap();
        assert_eq!(cfg.max_client_count, 4);
        assert_eq!(cfg.timeout_ms, 5000);
    }
}
