//! Bus configuration and the backend factory that turns it into clients.

use std::time::Duration;

use super::error::ConnectError;
use super::group::GroupCoordinator;
use super::publisher::Publisher;
use super::reader::Reader;

/// Default slice for blocking waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default budget for `EventBus::close`.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(25);

/// Where and how an `EventBus` connects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusConfig {
    /// `host:port` bootstrap addresses
    pub brokers: Vec<String>,
    pub topic: String,
    /// Consumer group. Empty means unmanaged reading over all partitions.
    pub group_id: String,
    pub client_id: String,
    /// Longest single blocking wait; bounds how quickly `close` is observed
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl BusConfig {
    pub fn new(brokers: Vec<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers,
            topic: topic.into(),
            group_id: String::new(),
            client_id: "cafebucks".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Whether reads go through a consumer group.
    pub fn is_managed(&self) -> bool {
        !self.group_id.is_empty()
    }

    /// Reject configurations no backend could use.
    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.brokers.is_empty() {
            return Err(ConnectError::InvalidConfig("no broker addresses".into()));
        }
        if let Some(bad) = self.brokers.iter().find(|b| !is_host_port(b)) {
            return Err(ConnectError::InvalidConfig(format!(
                "broker address {bad:?} is not host:port"
            )));
        }
        if self.topic.trim().is_empty() {
            return Err(ConnectError::InvalidConfig("empty topic".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConnectError::InvalidConfig("poll interval must be positive".into()));
        }
        Ok(())
    }
}

/// `host:port` with a non-empty host and a numeric port.
pub(crate) fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Builds the backend clients an `EventBus` owns.
///
/// Implementations:
/// - `InMemoryBroker` - in-process log for tests and local runs
/// - `KafkaConnector` - Apache Kafka via librdkafka (`kafka` feature)
pub trait Connector {
    type Publisher: Publisher + 'static;
    type Reader: Reader + 'static;
    type Coordinator: GroupCoordinator + 'static;

    fn publisher(&self, config: &BusConfig) -> Result<Self::Publisher, ConnectError>;

    /// Unmanaged reader over every partition of `config.topic`.
    fn reader(&self, config: &BusConfig) -> Result<Self::Reader, ConnectError>;

    /// Group member for `config.group_id`, subscribed to `config.topic`.
    fn coordinator(&self, config: &BusConfig) -> Result<Self::Coordinator, ConnectError>;
}
