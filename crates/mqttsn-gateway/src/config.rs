// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::qos::RetryPolicy;
use crate::topics::{is_wildcarded, TOPIC_ID_RESERVED_HIGH, TOPIC_ID_RESERVED_LOW};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Process-wide predefined topics: client id -> (topic id -> topic name).
pub type PredefinedTopics = HashMap<String, HashMap<u16, String>>;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// UDP listener settings.
    #[serde(default)]
    pub gateway: ListenConfig,

    /// Upstream MQTT broker.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Acknowledgment timeouts and retries.
    #[serde(default)]
    pub qos: QosConfig,

    /// Session housekeeping.
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Predefined topic ids, per client.
    #[serde(default)]
    pub predefined: Vec<PredefinedTopic>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            gateway: ListenConfig::default(),
            broker: BrokerConfig::default(),
            qos: QosConfig::default(),
            sessions: SessionConfig::default(),
            predefined: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.port == 0 {
            return Err(ConfigError::Invalid("gateway.port must be > 0".into()));
        }
        if self.gateway.max_datagram_size < 16 {
            return Err(ConfigError::Invalid(
                "gateway.max_datagram_size must be >= 16".into(),
            ));
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".into()));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must be > 0".into()));
        }
        if self.qos.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("qos.ack_timeout_ms must be > 0".into()));
        }
        if self.qos.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "qos.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.qos.max_timeout_ms < self.qos.ack_timeout_ms {
            return Err(ConfigError::Invalid(
                "qos.max_timeout_ms must be >= qos.ack_timeout_ms".into(),
            ));
        }
        if self.sessions.sleep_buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "sessions.sleep_buffer_capacity must be > 0".into(),
            ));
        }
        if self.sessions.housekeeping_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sessions.housekeeping_interval_ms must be > 0".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (i, entry) in self.predefined.iter().enumerate() {
            if entry.client_id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Predefined topic {} has empty client_id",
                    i
                )));
            }
            if entry.topic_id == TOPIC_ID_RESERVED_LOW || entry.topic_id == TOPIC_ID_RESERVED_HIGH
            {
                return Err(ConfigError::Invalid(format!(
                    "Predefined topic {} uses reserved topic id 0x{:04x}",
                    i, entry.topic_id
                )));
            }
            if entry.topic_name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Predefined topic {} has empty topic_name",
                    i
                )));
            }
            if is_wildcarded(&entry.topic_name) {
                return Err(ConfigError::Invalid(format!(
                    "Predefined topic {} ({}) contains a wildcard",
                    i, entry.topic_name
                )));
            }
            if !seen.insert((entry.client_id.as_str(), entry.topic_id)) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate predefined topic id {} for client {}",
                    entry.topic_id, entry.client_id
                )));
            }
        }

        Ok(())
    }

    /// Fold the `[[predefined]]` entries into the lookup table.
    pub fn predefined_topics(&self) -> PredefinedTopics {
        let mut table = PredefinedTopics::new();
        for entry in &self.predefined {
            table
                .entry(entry.client_id.clone())
                .or_default()
                .insert(entry.topic_id, entry.topic_name.clone());
        }
        table
    }

    /// Add a predefined topic.
    pub fn add_predefined(
        &mut self,
        client_id: impl Into<String>,
        topic_id: u16,
        topic_name: impl Into<String>,
    ) {
        self.predefined.push(PredefinedTopic {
            client_id: client_id.into(),
            topic_id,
            topic_name: topic_name.into(),
        });
    }

    /// Listen address as `host:port`.
    pub fn listen_addr(&self) -> String {
        if self.gateway.host.contains(':') {
            format!("[{}]:{}", self.gateway.host, self.gateway.port)
        } else {
            format!("{}:{}", self.gateway.host, self.gateway.port)
        }
    }
}

/// UDP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Bind host (default: 0.0.0.0).
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port (default: 1884).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Gateway id advertised in GWINFO.
    #[serde(default = "default_gateway_id")]
    pub gateway_id: u8,

    /// Receive buffer size for a single datagram.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1884
}

fn default_gateway_id() -> u8 {
    1
}

fn default_max_datagram_size() -> usize {
    2048
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            gateway_id: default_gateway_id(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

/// Upstream MQTT broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker host (default: localhost).
    #[serde(default = "default_broker_host")]
    pub host: String,

    /// Broker port (default: 1883).
    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Optional username.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,

    /// MQTT keep-alive towards the broker (seconds).
    #[serde(default = "default_broker_keep_alive")]
    pub keep_alive_secs: u64,

    /// Prefix prepended to the MQTT-SN client id on the broker connection.
    #[serde(default)]
    pub client_id_prefix: String,

    /// Request queue capacity of each broker connection.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_broker_keep_alive() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: None,
            password: None,
            keep_alive_secs: default_broker_keep_alive(),
            client_id_prefix: String::new(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Acknowledgment wait and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosConfig {
    /// First acknowledgment timeout (milliseconds).
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timeout growth factor between attempts.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for a single attempt's timeout (milliseconds).
    #[serde(default = "default_max_timeout")]
    pub max_timeout_ms: u64,
}

fn default_ack_timeout() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_timeout() -> u64 {
    16_000
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            max_retries: default_max_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            max_timeout_ms: default_max_timeout(),
        }
    }
}

impl QosConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retries: self.max_retries,
            backoff_multiplier: self.backoff_multiplier,
            max_timeout: Duration::from_millis(self.max_timeout_ms),
        }
    }
}

/// Session housekeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Broker messages kept per asleep session; oldest dropped on overflow.
    #[serde(default = "default_sleep_buffer")]
    pub sleep_buffer_capacity: usize,

    /// Period of the keep-alive / sleep expiry sweep (milliseconds).
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_ms: u64,
}

fn default_sleep_buffer() -> usize {
    64
}

fn default_housekeeping_interval() -> u64 {
    1_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sleep_buffer_capacity: default_sleep_buffer(),
            housekeeping_interval_ms: default_housekeeping_interval(),
        }
    }
}

/// One predefined topic id for one client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PredefinedTopic {
    pub client_id: String,
    pub topic_id: u16,
    pub topic_name: String,
}
