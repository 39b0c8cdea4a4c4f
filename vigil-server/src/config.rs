//! Server configuration: embedded TOML defaults, overridable per value from
//! the command line.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub upstream: UpstreamSection,
    pub storage: StorageSection,
    pub push: PushSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub port: u16,
    pub secrets_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    pub url: String,
    pub timeout_ms: u64,
    pub reload_interval_seconds: u64,
    pub token_cache_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub host_timeout_seconds: u64,
    pub component_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushSection {
    pub queue_capacity: usize,
    pub ping_interval_seconds: u64,
    pub write_deadline_seconds: u64,
    pub read_deadline_seconds: u64,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("default config to parse")
    }
}

impl UpstreamSection {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_seconds)
    }

    #[must_use]
    pub const fn token_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.token_cache_seconds)
    }
}

impl StorageSection {
    #[must_use]
    pub const fn host_ttl(&self) -> Duration {
        Duration::from_secs(self.host_timeout_seconds)
    }

    #[must_use]
    pub const fn component_ttl(&self) -> Duration {
        Duration::from_secs(self.component_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse() {
        let config = ServerConfig::default();
        assert_eq!(config.storage.host_timeout_seconds, 60);
        assert_eq!(config.storage.component_timeout_seconds, 300);
        assert_eq!(config.upstream.timeout_ms, 800);
        assert_eq!(config.push.max_frame_bytes, 256);
    }
}
