//! Apache Kafka backend via librdkafka (`kafka` feature).
//!
//! - `KafkaPublisher` - `BaseProducer`, one in-flight send at a time, each
//!   waiting for its delivery report
//! - `KafkaReader` - `BaseConsumer` manually assigned to every partition
//! - `KafkaGroup` - subscribed `BaseConsumer`; each partition assignment the
//!   broker hands out starts a new local generation

mod group;
mod producer;
mod reader;

pub use group::KafkaGroup;
pub use producer::KafkaPublisher;
pub use reader::KafkaReader;

use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::ClientConfig;

use super::connector::{BusConfig, Connector};
use super::error::{ConnectError, GroupError, PublishError, ReadError};
use super::message::Message;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds Kafka clients from a `BusConfig`.
///
/// Extra librdkafka properties set with `with` apply to every client.
#[derive(Clone, Debug, Default)]
pub struct KafkaConnector {
    overrides: Vec<(String, String)>,
}

impl KafkaConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a librdkafka property, e.g. `security.protocol`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    fn client_config(&self, config: &BusConfig) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", config.client_id.as_str());
        for (key, value) in &self.overrides {
            client.set(key.as_str(), value.as_str());
        }
        client
    }
}

impl Connector for KafkaConnector {
    type Publisher = KafkaPublisher;
    type Reader = KafkaReader;
    type Coordinator = KafkaGroup;

    fn publisher(&self, config: &BusConfig) -> Result<KafkaPublisher, ConnectError> {
        KafkaPublisher::new(self.client_config(config)).map_err(|e| backend(config, e))
    }

    fn reader(&self, config: &BusConfig) -> Result<KafkaReader, ConnectError> {
        KafkaReader::new(self.client_config(config), config).map_err(|e| backend(config, e))
    }

    fn coordinator(&self, config: &BusConfig) -> Result<KafkaGroup, ConnectError> {
        KafkaGroup::new(self.client_config(config), config).map_err(|e| backend(config, e))
    }
}

fn backend(config: &BusConfig, e: KafkaError) -> ConnectError {
    ConnectError::Backend {
        brokers: config.brokers.clone(),
        reason: e.to_string(),
    }
}

fn is_transport(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut
    )
}

fn is_stale_generation(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::UnknownMemberId
    )
}

fn is_coordinator(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::CoordinatorLoadInProgress
    )
}

pub(crate) fn publish_error(e: KafkaError) -> PublishError {
    match e.rdkafka_error_code() {
        Some(code) if is_transport(code) => PublishError::ConnectionLost(e.to_string()),
        _ => PublishError::BrokerRejected(e.to_string()),
    }
}

pub(crate) fn read_error(e: KafkaError) -> ReadError {
    match e {
        KafkaError::PartitionEOF(_) => ReadError::Timeout,
        other => ReadError::ConnectionLost(other.to_string()),
    }
}

pub(crate) fn group_error(e: KafkaError, held: super::generation::GenerationId) -> GroupError {
    match e.rdkafka_error_code() {
        Some(code) if is_stale_generation(code) => GroupError::StaleGeneration {
            held,
            current: None,
        },
        Some(code) if is_coordinator(code) || is_transport(code) => {
            GroupError::CoordinatorUnavailable(e.to_string())
        }
        _ => GroupError::Rejected(e.to_string()),
    }
}

pub(crate) fn coordinator_error(e: KafkaError) -> GroupError {
    match e.rdkafka_error_code() {
        Some(code) if is_coordinator(code) || is_transport(code) => {
            GroupError::CoordinatorUnavailable(e.to_string())
        }
        _ => GroupError::Rejected(e.to_string()),
    }
}

/// Copy a librdkafka message out of the consumer's buffer.
pub(crate) fn to_message<M: KafkaMessage>(m: &M) -> Message {
    let headers = m
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    Message {
        topic: m.topic().to_string(),
        partition: m.partition(),
        offset: m.offset(),
        key: m.key().map(<[u8]>::to_vec).unwrap_or_default(),
        value: m.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}
