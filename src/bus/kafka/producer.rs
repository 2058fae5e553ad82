use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{Header, Message as KafkaMessage, OwnedHeaders};
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::{ClientConfig, ClientContext};
use tracing::warn;

use super::publish_error;
use crate::bus::error::PublishError;
use crate::bus::message::{Delivery, Record};
use crate::bus::publisher::Publisher;

/// Upper bound on a single send, matching `message.timeout.ms` plus slack.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);
const DELIVERY_WAIT: Duration = Duration::from_secs(35);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_SLICE: Duration = Duration::from_millis(50);

type DeliveryReport = Result<Delivery, PublishError>;

/// Routes each delivery report to the sender waiting on it.
pub struct DeliveryContext;

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<Sender<DeliveryReport>>;

    fn delivery(&self, result: &DeliveryResult<'_>, reply: Self::DeliveryOpaque) {
        let report = match result {
            Ok(message) => Ok(Delivery {
                partition: message.partition(),
                offset: Some(message.offset()),
            }),
            Err((e, _)) => Err(publish_error(e.clone())),
        };
        let _ = reply.send(report);
    }
}

/// Kafka publisher.
///
/// `BaseProducer` is driven by polling, so sends are serialized behind a mutex
/// and each waits for its own delivery report before returning.
pub struct KafkaPublisher {
    producer: Mutex<Option<BaseProducer<DeliveryContext>>>,
}

impl KafkaPublisher {
    pub fn new(mut config: ClientConfig) -> KafkaResult<Self> {
        let producer: BaseProducer<DeliveryContext> = config
            .set("message.timeout.ms", MESSAGE_TIMEOUT.as_millis().to_string())
            .create_with_context(DeliveryContext)?;
        Ok(Self {
            producer: Mutex::new(Some(producer)),
        })
    }

    fn await_delivery(
        producer: &BaseProducer<DeliveryContext>,
        reports: &Receiver<DeliveryReport>,
    ) -> Result<Delivery, PublishError> {
        let deadline = Instant::now() + DELIVERY_WAIT;
        loop {
            producer.poll(POLL_SLICE);
            if let Ok(report) = reports.try_recv() {
                return report;
            }
            if Instant::now() >= deadline {
                return Err(PublishError::ConnectionLost(
                    "no delivery report before timeout".into(),
                ));
            }
        }
    }
}

impl Publisher for KafkaPublisher {
    fn publish(&self, record: Record<'_>) -> Result<Delivery, PublishError> {
        let guard = self.producer.lock().unwrap_or_else(|e| e.into_inner());
        let producer = guard.as_ref().ok_or(PublishError::Closed)?;

        let headers = record
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: *key,
                    value: Some(*value),
                })
            });

        let (tx, rx) = channel();
        let mut outgoing = BaseRecord::with_opaque_to(record.topic, Box::new(tx))
            .key(record.key)
            .payload(record.value)
            .headers(headers);

        loop {
            match producer.send(outgoing) {
                Ok(()) => break,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    producer.poll(POLL_SLICE);
                    outgoing = returned;
                }
                Err((e, _)) => return Err(publish_error(e)),
            }
        }

        Self::await_delivery(producer, &rx)
    }

    fn close(&self) {
        let taken = self.producer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(producer) = taken {
            if let Err(e) = producer.flush(FLUSH_TIMEOUT) {
                warn!(error = %e, "producer flush failed on close");
            }
        }
    }
}
