//! Core publisher trait for the event bus.

use super::error::PublishError;
use super::message::{Delivery, Record};

/// Trait for writing records to a broker topic.
///
/// Implementations must be safe to call from several threads at once; a backend
/// whose client is not thread-safe serializes writes internally.
///
/// Implementations:
/// - `InMemoryPublisher` - for tests and single-process use
/// - `KafkaPublisher` - Apache Kafka via librdkafka (`kafka` feature)
pub trait Publisher: Send + Sync {
    /// Write a single record.
    ///
    /// Returns once the record has been handed to the broker's write path. A
    /// connection failure after that point may still surface as
    /// `PublishError::ConnectionLost`; the record may then have been stored.
    fn publish(&self, record: Record<'_>) -> Result<Delivery, PublishError>;

    /// Release the underlying connection. Later publishes fail with `Closed`.
    fn close(&self);
}
