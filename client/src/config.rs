//! Client configuration.
//!
//! Defaults match the development broker on `localhost:8080`. Embedders can
//! deserialize a `ClientConfig` from JSON (camelCase keys, missing keys take
//! defaults) or load it from `PULSE_*` environment variables.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::time::Duration;

use frames::HeartBeat;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BROKER_URL: &str = "http://localhost:8080/ws";
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_HEARTBEAT_MS: u64 = 4000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Connection settings shared by the manager, the REST fallback, and the CLI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Broker endpoint. `http(s)` URLs are treated as SockJS endpoints.
    pub broker_url: String,
    /// Base URL for the REST broadcast/demo endpoints.
    pub api_base_url: String,
    /// Heart-beat interval offered in both directions; 0 disables heart-beats.
    pub heartbeat_ms: u64,
    /// Delay before an automatic reconnect; 0 disables reconnecting.
    pub reconnect_delay_ms: u64,
    /// Upper bound on one connection attempt.
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_owned(),
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    /// Load config from environment with defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            broker_url: env_string("PULSE_BROKER_URL", DEFAULT_BROKER_URL),
            api_base_url: env_string("PULSE_API_BASE_URL", DEFAULT_API_BASE_URL),
            heartbeat_ms: env_u64("PULSE_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS),
            reconnect_delay_ms: env_u64("PULSE_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS),
            connect_timeout_ms: env_u64("PULSE_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    /// Heart-beat header value sent in `CONNECT`.
    #[must_use]
    pub fn heart_beat(&self) -> HeartBeat {
        HeartBeat::new(self.heartbeat_ms, self.heartbeat_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when automatic reconnect is disabled.
    #[must_use]
    pub fn reconnect_delay(&self) -> Option<Duration> {
        (self.reconnect_delay_ms > 0).then(|| Duration::from_millis(self.reconnect_delay_ms))
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
