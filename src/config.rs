//! Process configuration, built once at startup and passed to constructors.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "PROVISIONING_";

/// Error type for configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("ack_threshold_secs ({threshold}) must be smaller than ack_wait_secs ({ack_wait})")]
    AckThreshold { ack_wait: u64, threshold: u64 },
    #[error("max_reconnect_attempts must be at least 1")]
    NoReconnectAttempts,
    #[error("no object source registered for realm {0}")]
    MissingSource(String),
}

/// How registration starts a prefill.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefillMode {
    /// Publish a request on the prefill stream for the prefill worker.
    #[default]
    Queue,
    /// Run the prefill as a task of the registering process.
    Spawn,
}

impl FromStr for PrefillMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queue" => Ok(PrefillMode::Queue),
            "spawn" => Ok(PrefillMode::Spawn),
            _ => Err(format!("invalid prefill mode: {s}")),
        }
    }
}

impl fmt::Display for PrefillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefillMode::Queue => f.write_str("queue"),
            PrefillMode::Spawn => f.write_str("spawn"),
        }
    }
}

/// Service configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Deliveries of a prefill request before it is abandoned; `0` never gives up.
    #[serde(default = "default_max_prefill_attempts")]
    pub max_prefill_attempts: u32,
    /// Broker lease on a delivered message.
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
    /// Margin before the lease runs out at which it is extended.
    #[serde(default = "default_ack_threshold_secs")]
    pub ack_threshold_secs: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub dispatcher_poll_timeout_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub prefill_poll_timeout_ms: u64,
    /// Read timeout when a consumer does not give one.
    #[serde(default = "default_message_timeout_ms")]
    pub default_message_timeout_ms: u64,
    #[serde(default)]
    pub prefill_mode: PrefillMode,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_addr() -> String {
    "0.0.0.0:7777".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_max_prefill_attempts() -> u32 {
    3
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_ack_threshold_secs() -> u64 {
    5
}

fn default_poll_timeout_ms() -> u64 {
    10_000
}

fn default_message_timeout_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            http_addr: default_http_addr(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_prefill_attempts: default_max_prefill_attempts(),
            ack_wait_secs: default_ack_wait_secs(),
            ack_threshold_secs: default_ack_threshold_secs(),
            dispatcher_poll_timeout_ms: default_poll_timeout_ms(),
            prefill_poll_timeout_ms: default_poll_timeout_ms(),
            default_message_timeout_ms: default_message_timeout_ms(),
            prefill_mode: PrefillMode::default(),
        }
    }
}

impl Config {
    /// Load configuration from `PROVISIONING_*` environment variables.
    ///
    /// Unset or unparsable variables fall back to their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        Self {
            log_level: parse("LOG_LEVEL").unwrap_or_else(default_log_level),
            http_addr: parse("HTTP_ADDR").unwrap_or_else(default_http_addr),
            max_reconnect_attempts: parse_env(parse("MAX_RECONNECT_ATTEMPTS"))
                .unwrap_or_else(default_max_reconnect_attempts),
            max_prefill_attempts: parse_env(parse("MAX_PREFILL_ATTEMPTS"))
                .unwrap_or_else(default_max_prefill_attempts),
            ack_wait_secs: parse_env(parse("ACK_WAIT_SECS")).unwrap_or_else(default_ack_wait_secs),
            ack_threshold_secs: parse_env(parse("ACK_THRESHOLD_SECS"))
                .unwrap_or_else(default_ack_threshold_secs),
            dispatcher_poll_timeout_ms: parse_env(parse("DISPATCHER_POLL_TIMEOUT_MS"))
                .unwrap_or_else(default_poll_timeout_ms),
            prefill_poll_timeout_ms: parse_env(parse("PREFILL_POLL_TIMEOUT_MS"))
                .unwrap_or_else(default_poll_timeout_ms),
            default_message_timeout_ms: parse_env(parse("DEFAULT_MESSAGE_TIMEOUT_MS"))
                .unwrap_or_else(default_message_timeout_ms),
            prefill_mode: parse_env(parse("PREFILL_MODE")).unwrap_or_default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_threshold_secs >= self.ack_wait_secs {
            return Err(ConfigError::AckThreshold {
                ack_wait: self.ack_wait_secs,
                threshold: self.ack_threshold_secs,
            });
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::NoReconnectAttempts);
        }
        Ok(())
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn ack_threshold(&self) -> Duration {
        Duration::from_secs(self.ack_threshold_secs)
    }

    pub fn dispatcher_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher_poll_timeout_ms)
    }

    pub fn prefill_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.prefill_poll_timeout_ms)
    }

    pub fn default_message_timeout(&self) -> Duration {
        Duration::from_millis(self.default_message_timeout_ms)
    }
}

fn parse_env<T: FromStr>(value: Option<String>) -> Option<T> {
    value?.trim().parse().ok()
}
