//! Process configuration from environment variables.
//!
//! | Variable                | Default          |
//! |-------------------------|------------------|
//! | `PORT`                  | `8080`           |
//! | `LOG_LEVEL`             | `info`           |
//! | `ENV`                   | `development`    |
//! | `BOOTSTRAP_SERVERS`     | `localhost:9092` |
//! | `TOPIC`                 | `orders`         |
//! | `GROUP_ID`              | empty (no group) |
//! | `CLIENT_ID`             | `cafebucks`      |
//! | `SHUTDOWN_TIMEOUT_SECS` | `25`             |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::bus::{BusConfig, DEFAULT_POLL_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BOOTSTRAP: &str = "localhost:9092";

/// Error returned when the environment holds an unusable value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse PORT {value:?}: {reason}")]
    Port { value: String, reason: String },
    #[error("unknown LOG_LEVEL {0:?}")]
    LogLevel(String),
    #[error("invalid broker address {0:?} in BOOTSTRAP_SERVERS (expected host:port)")]
    Address(String),
    #[error("invalid SHUTDOWN_TIMEOUT_SECS {0:?}")]
    ShutdownTimeout(String),
}

/// Log verbosity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::LogLevel(s.to_string())),
        }
    }
}

/// Runtime environment. Anything unrecognised is `Development`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Testing,
    Staging,
    Production,
}

impl Environment {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" => Environment::Production,
            "staging" => Environment::Staging,
            "testing" => Environment::Testing,
            _ => Environment::Development,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KafkaSettings {
    pub bootstrap_servers: Vec<String>,
}

/// Settings for the bus a process opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusSettings {
    pub topic: String,
    pub group_id: String,
    pub client_id: String,
    pub shutdown_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub log_level: LogLevel,
    pub env: Environment,
    /// TCP port for the HTTP server
    pub port: u16,
    pub kafka: KafkaSettings,
    pub bus: BusSettings,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup; unset and empty values take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT") {
            Some(p) => p.trim().parse::<u16>().map_err(|e| ConfigError::Port {
                value: p.clone(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let log_level = match get("LOG_LEVEL") {
            Some(level) => level.parse()?,
            None => LogLevel::default(),
        };

        let env = get("ENV").map(|e| Environment::parse(&e)).unwrap_or_default();

        let bootstrap_servers =
            parse_servers(&get("BOOTSTRAP_SERVERS").unwrap_or_else(|| DEFAULT_BOOTSTRAP.into()))?;

        let shutdown_timeout = match get("SHUTDOWN_TIMEOUT_SECS") {
            Some(secs) => secs
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::ShutdownTimeout(secs.clone()))?,
            None => DEFAULT_SHUTDOWN_TIMEOUT,
        };

        Ok(Self {
            log_level,
            env,
            port,
            kafka: KafkaSettings { bootstrap_servers },
            bus: BusSettings {
                topic: get("TOPIC").unwrap_or_else(|| "orders".into()),
                group_id: get("GROUP_ID").unwrap_or_default(),
                client_id: get("CLIENT_ID").unwrap_or_else(|| "cafebucks".into()),
                shutdown_timeout,
            },
        })
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            brokers: self.kafka.bootstrap_servers.clone(),
            topic: self.bus.topic.clone(),
            group_id: self.bus.group_id.clone(),
            client_id: self.bus.client_id.clone(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: self.bus.shutdown_timeout,
        }
    }
}

fn parse_servers(raw: &str) -> Result<Vec<String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .map(|addr| {
            if crate::bus::is_host_port(addr) {
                Ok(addr.to_string())
            } else {
                Err(ConfigError::Address(addr.to_string()))
            }
        })
        .collect()
}
