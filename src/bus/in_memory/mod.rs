//! In-memory backend for testing and single-process scenarios.
//!
//! `InMemoryBroker` keeps a partitioned log and runs the consumer-group protocol
//! in process, so the whole bus (generations, rebalances, commits) can be
//! exercised without external dependencies. It is also the fault-injection point
//! for tests: outages, lost acknowledgements, and forced rebalances.

mod broker;
mod client;

pub use broker::{CommitRecord, InMemoryBroker};
pub use client::{InMemoryGroup, InMemoryPublisher, InMemoryReader};

use super::connector::{BusConfig, Connector};
use super::error::ConnectError;

impl InMemoryBroker {
    fn require_topic(&self, config: &BusConfig) -> Result<(), ConnectError> {
        match self.partitions(&config.topic) {
            Some(_) => Ok(()),
            None => Err(ConnectError::Backend {
                brokers: config.brokers.clone(),
                reason: format!("unknown topic {}", config.topic),
            }),
        }
    }
}

impl Connector for InMemoryBroker {
    type Publisher = InMemoryPublisher;
    type Reader = InMemoryReader;
    type Coordinator = InMemoryGroup;

    fn publisher(&self, config: &BusConfig) -> Result<InMemoryPublisher, ConnectError> {
        self.require_topic(config)?;
        Ok(InMemoryPublisher::new(self.clone()))
    }

    fn reader(&self, config: &BusConfig) -> Result<InMemoryReader, ConnectError> {
        self.require_topic(config)?;
        Ok(InMemoryReader::new(self.clone(), config.topic.clone()))
    }

    fn coordinator(&self, config: &BusConfig) -> Result<InMemoryGroup, ConnectError> {
        self.require_topic(config)?;
        Ok(InMemoryGroup::new(
            self.clone(),
            config.group_id.clone(),
            &config.client_id,
            vec![config.topic.clone()],
        ))
    }
}
