use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub coordinator: CoordinatorConfig,
    pub lecture_store: LectureStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// "json" for production, "pretty" for development
    pub format: String,
    /// Optional log file path (appended to stdout output)
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// ICE server entry handed to the media engine (STUN/TURN)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// ICE servers used for server-side transports
    pub ice_servers: Vec<IceServerEntry>,
    /// Public IP/host substituted into ICE candidates (NAT 1:1, for
    /// containerized deployments). Empty = no substitution.
    pub public_host: String,
    /// UDP port range for engine transports (0/0 = ephemeral)
    pub udp_port_min: u16,
    pub udp_port_max: u16,
    /// Bound on ICE candidate gathering during transport connect
    pub ice_gathering_timeout_seconds: u64,
    /// Interval between keyframe (PLI) requests towards producers
    pub keyframe_request_interval_seconds: u64,
    /// Capacity of the per-track RTP fan-out channel
    pub rtp_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerEntry {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            public_host: String::new(),
            udp_port_min: 0,
            udp_port_max: 0,
            ice_gathering_timeout_seconds: 10,
            keyframe_request_interval_seconds: 3,
            rtp_channel_capacity: 512,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_secs(self.ice_gathering_timeout_seconds)
    }

    #[must_use]
    pub const fn keyframe_request_interval(&self) -> Duration {
        Duration::from_secs(self.keyframe_request_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Bound on any single media engine call; a call that exceeds it fails
    /// the request with an engine error and commits nothing
    pub engine_call_timeout_seconds: u64,
    /// A peer silent for longer than this is treated as disconnected
    pub heartbeat_timeout_seconds: u64,
    /// Interval of the background sweep that evicts silent peers
    pub heartbeat_sweep_interval_seconds: u64,
    /// Maximum concurrent peer connections (0 = unlimited)
    pub max_peers: usize,
    /// Maximum concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum viewers per room (0 = unlimited)
    pub max_viewers_per_room: usize,
    /// Chat messages longer than this are truncated
    pub max_chat_message_chars: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            engine_call_timeout_seconds: 15,
            heartbeat_timeout_seconds: 60,
            heartbeat_sweep_interval_seconds: 20,
            max_peers: 10_000,
            max_rooms: 0,
            max_viewers_per_room: 500,
            max_chat_message_chars: 2000,
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub const fn engine_call_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_call_timeout_seconds)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    #[must_use]
    pub const fn heartbeat_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sweep_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LectureStoreConfig {
    /// Base URL of the upstream lecture record service. Empty = local
    /// token generation (no upstream).
    pub base_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for LectureStoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_seconds: 10,
        }
    }
}

impl Config {
    fn load(file_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = file_path {
            builder = builder.add_source(File::with_name(path));
        }

        // Override with environment variables (LECTERN_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("LECTERN")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Validate configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "warning" | "error" => {}
            other => errors.push(format!("logging.level is invalid: {other}")),
        }

        if self.engine.udp_port_min > self.engine.udp_port_max {
            errors.push(format!(
                "engine.udp_port_min ({}) exceeds engine.udp_port_max ({})",
                self.engine.udp_port_min, self.engine.udp_port_max
            ));
        }

        if self.coordinator.engine_call_timeout_seconds == 0 {
            errors.push("coordinator.engine_call_timeout_seconds must be non-zero".to_string());
        }

        if self.coordinator.heartbeat_timeout_seconds
            <= self.coordinator.heartbeat_sweep_interval_seconds / 2
        {
            errors.push(
                "coordinator.heartbeat_timeout_seconds is too small relative to the sweep interval"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        let errors = config.validate().expect_err("should reject");
        assert!(errors.iter().any(|e| e.contains("logging.level")));
    }

    #[test]
    fn test_udp_range_validated() {
        let mut config = Config::default();
        config.engine.udp_port_min = 50000;
        config.engine.udp_port_max = 40000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_engine_timeout_rejected() {
        let mut config = Config::default();
        config.coordinator.engine_call_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.engine_call_timeout(), Duration::from_secs(15));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(60));
    }
}
