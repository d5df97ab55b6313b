//! Daemon configuration loaded from TOML.

use std::time::Duration;

use localnet_discovery::wire::DEFAULT_DISCOVERY_PORT;
use localnet_discovery::ElectionConfig;
use localnet_protocol::wire::{DEFAULT_SESSION_PORT, IDLE_TIMEOUT, PING_INTERVAL};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub election: ElectionSettings,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Config {
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            port: self.network.discovery_port,
            heartbeat_interval: Duration::from_millis(self.election.heartbeat_interval_ms),
            election_interval: Duration::from_millis(self.election.election_interval_ms),
            candidate_timeout: Duration::from_millis(self.election.candidate_timeout_ms),
        }
    }

    pub fn session_timings(&self) -> SessionTimings {
        SessionTimings {
            settle_delay: Duration::from_millis(self.session.settle_delay_ms),
            retry_delay: Duration::from_millis(self.session.retry_delay_ms),
            ping_interval: Duration::from_secs(self.session.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
        }
    }
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Whether the elected host also joins its own hub as a client.
    #[serde(default = "default_true")]
    pub host_joins_as_client: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            host_joins_as_client: true,
        }
    }
}

/// Ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_session_port")]
    pub session_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            session_port: default_session_port(),
            discovery_port: default_discovery_port(),
        }
    }
}

/// Heartbeat and election timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSettings {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_election_interval_ms")]
    pub election_interval_ms: u64,
    #[serde(default = "default_candidate_timeout_ms")]
    pub candidate_timeout_ms: u64,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_interval_ms: default_election_interval_ms(),
            candidate_timeout_ms: default_candidate_timeout_ms(),
        }
    }
}

/// Session hub and client timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// Local address resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_address_retries")]
    pub address_retries: u32,
    #[serde(default = "default_address_retry_delay_ms")]
    pub address_retry_delay_ms: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            address_retries: default_address_retries(),
            address_retry_delay_ms: default_address_retry_delay_ms(),
        }
    }
}

/// Runtime durations for the hub and the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Wait between a host change and connecting to it.
    pub settle_delay: Duration,
    /// Wait between connect attempts while the host is unreachable.
    pub retry_delay: Duration,
    pub ping_interval: Duration,
    /// A session silent for this long is dropped.
    pub idle_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Config::default().session_timings()
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_session_port() -> u16 {
    DEFAULT_SESSION_PORT
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_election_interval_ms() -> u64 {
    3000
}

fn default_candidate_timeout_ms() -> u64 {
    4000
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_ping_interval_secs() -> u64 {
    PING_INTERVAL.as_secs()
}

fn default_idle_timeout_secs() -> u64 {
    IDLE_TIMEOUT.as_secs()
}

fn default_address_retries() -> u32 {
    10
}

fn default_address_retry_delay_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("session_port = 63287"));
        assert!(toml_str.contains("discovery_port = 60000"));
    }

    #[test]
    fn parse_example_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
host_joins_as_client = false

[network]
session_port = 7000

[election]
candidate_timeout_ms = 2500

[session]
ping_interval_secs = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert!(!config.daemon.host_joins_as_client);
        assert_eq!(config.network.session_port, 7000);
        assert_eq!(config.network.discovery_port, 60000);
        assert_eq!(config.election.candidate_timeout_ms, 2500);
        assert_eq!(config.election.heartbeat_interval_ms, 1000);
        assert_eq!(config.session.ping_interval_secs, 5);
        assert_eq!(config.identity.address_retries, 10);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.daemon.host_joins_as_client);
        assert_eq!(config.election_config(), ElectionConfig::default());
    }

    #[test]
    fn timings_convert_units() {
        let timings = Config::default().session_timings();
        assert_eq!(timings.settle_delay, Duration::from_millis(1000));
        assert_eq!(timings.ping_interval, Duration::from_secs(15));
        assert_eq!(timings.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn keep_alive_defaults_follow_the_wire_constants() {
        let timings = SessionTimings::default();
        assert_eq!(timings.ping_interval, PING_INTERVAL);
        assert_eq!(timings.idle_timeout, IDLE_TIMEOUT);
    }
}
