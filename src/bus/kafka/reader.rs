use std::sync::Mutex;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Offset as KafkaOffset, TopicPartitionList};
use tracing::debug;

use super::{read_error, to_message, METADATA_TIMEOUT};
use crate::bus::connector::BusConfig;
use crate::bus::error::ReadError;
use crate::bus::message::{Message, Offset, Partition};
use crate::bus::reader::Reader;

/// Reads every partition of one topic from the beginning, outside any group.
pub struct KafkaReader {
    topic: String,
    consumer: Mutex<Option<BaseConsumer>>,
}

impl KafkaReader {
    pub fn new(mut client: ClientConfig, config: &BusConfig) -> KafkaResult<Self> {
        // librdkafka wants a group id even for manual assignment; nothing is committed.
        let consumer: BaseConsumer = client
            .set("group.id", format!("{}-reader", config.client_id))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        let metadata = consumer.fetch_metadata(Some(config.topic.as_str()), METADATA_TIMEOUT)?;
        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == config.topic)
            .ok_or_else(|| KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownTopic))?;
        if let Some(err) = topic.error() {
            return Err(KafkaError::MetadataFetch(err.into()));
        }

        let mut assignment = TopicPartitionList::new();
        for partition in topic.partitions() {
            assignment.add_partition_offset(&config.topic, partition.id(), KafkaOffset::Beginning)?;
        }
        consumer.assign(&assignment)?;
        debug!(topic = %config.topic, partitions = topic.partitions().len(), "reader assigned");

        Ok(Self {
            topic: config.topic.clone(),
            consumer: Mutex::new(Some(consumer)),
        })
    }
}

impl Reader for KafkaReader {
    fn read(&self, timeout: Duration) -> Result<Message, ReadError> {
        let guard = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
        let consumer = guard.as_ref().ok_or(ReadError::Closed)?;
        match consumer.poll(timeout) {
            Some(Ok(message)) => Ok(to_message(&message)),
            Some(Err(e)) => Err(read_error(e)),
            None => Err(ReadError::Timeout),
        }
    }

    fn seek(&self, partition: Partition, offset: Offset) -> Result<(), ReadError> {
        let guard = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
        let consumer = guard.as_ref().ok_or(ReadError::Closed)?;

        // Reassigning with current positions works even for partitions not yet fetched.
        let mut positions = consumer.position().map_err(read_error)?;
        positions
            .set_partition_offset(&self.topic, partition, KafkaOffset::Offset(offset))
            .map_err(read_error)?;
        consumer.assign(&positions).map_err(read_error)
    }

    fn close(&self) {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
