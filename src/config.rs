//! Session configuration
//!
//! TOML-backed configuration covering the recognized surface: broker
//! endpoint, client identifier, TLS material paths, publish/subscribe
//! parameters, and reconnect backoff bounds. The client identifier is a
//! required, caller-supplied value - it is never inferred or defaulted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub broker: BrokerSection,
    pub tls: TlsSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub subscribe: SubscribeSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Broker endpoint and session identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker host name or address
    pub host: String,
    /// Broker port (default: 8883 for TLS)
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Client identifier presented to the broker (required)
    pub client_id: String,
    /// MQTT keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Bound on how long connect() may block
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Grace period for flushing acknowledgements on disconnect
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
}

/// Paths to PEM-encoded credential material
///
/// File loading happens in the binary entry point; the session core only
/// ever sees byte buffers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    /// CA certificate bundle in PEM format
    pub ca_file: String,
    /// Client certificate in PEM format
    pub cert_file: String,
    /// Client private key in PEM format
    pub key_file: String,
}

/// Publish-run parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishSection {
    /// Topic to publish to
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Quality of service level (0, 1, or 2)
    #[serde(default)]
    pub qos: u8,
    /// Broker-side retention of the last message
    #[serde(default)]
    pub retain: bool,
    /// Number of messages to send
    #[serde(default = "default_publish_count")]
    pub count: u32,
    /// Fixed interval between sends in milliseconds
    #[serde(default = "default_publish_interval_ms")]
    pub interval_ms: u64,
    /// Bound on waiting for each acknowledgement in milliseconds
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            qos: 0,
            retain: false,
            count: default_publish_count(),
            interval_ms: default_publish_interval_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

/// Subscribe-run parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeSection {
    /// Topic filter to subscribe to (wildcards allowed)
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Quality of service level (0, 1, or 2)
    #[serde(default = "default_subscribe_qos")]
    pub qos: u8,
    /// Wall-clock listen window in seconds
    #[serde(default = "default_subscribe_duration_secs")]
    pub duration_secs: u64,
}

impl Default for SubscribeSection {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            qos: default_subscribe_qos(),
            duration_secs: default_subscribe_duration_secs(),
        }
    }
}

/// Reconnect backoff bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// First retry delay in milliseconds
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on the exponential backoff in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    /// Retry budget (absent = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            max_attempts: None,
        }
    }
}

fn default_broker_port() -> u16 {
    8883
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_disconnect_grace_ms() -> u64 {
    250
}

fn default_topic() -> String {
    "topic_1".to_string()
}

fn default_publish_count() -> u32 {
    100
}

fn default_publish_interval_ms() -> u64 {
    1000
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

fn default_subscribe_qos() -> u8 {
    1
}

fn default_subscribe_duration_secs() -> u64 {
    9
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    30000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field-level constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.client_id must not be empty".to_string(),
            ));
        }
        if self.publish.qos > 2 || self.subscribe.qos > 2 {
            return Err(ConfigError::InvalidConfig(
                "qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must be >= initial_delay_ms".to_string(),
            ));
        }
        if self.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or absent".to_string(),
            ));
        }
        Ok(())
    }
}
