//! Core reader trait for unmanaged consumption.

use std::time::Duration;

use super::error::ReadError;
use super::message::{Message, Offset, Partition};

/// Trait for pulling records from every partition of one topic, outside any
/// consumer group.
///
/// Each partition is read in log order. No ordering holds across partitions.
pub trait Reader: Send + Sync {
    /// Wait up to `timeout` for the next record.
    ///
    /// Implementations must return within `timeout` (plus scheduling slack) so
    /// callers can slice long waits and observe cancellation.
    fn read(&self, timeout: Duration) -> Result<Message, ReadError>;

    /// Move the read position of `partition` to `offset`.
    fn seek(&self, partition: Partition, offset: Offset) -> Result<(), ReadError>;

    /// Release the underlying connection. Later reads fail with `Closed`.
    fn close(&self);
}
