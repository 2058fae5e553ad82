//! Records as they travel to and from the broker.

use crate::event::{Event, EventEnvelope, UnknownEvent};

use super::error::ReadError;

/// Partition index within a topic.
pub type Partition = i32;

/// Position within a partition. A committed offset names the next record to read.
pub type Offset = i64;

/// Header carrying the event kind alongside the key.
pub const EVENT_HEADER: &str = "event";

/// A record read from a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
    /// Routing key; the event kind tag for messages published by this crate
    pub key: Vec<u8>,
    /// Serialized payload (JSON for envelopes)
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl Message {
    /// Value of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    /// The event kind, taken from the key.
    pub fn kind(&self) -> Result<Event, UnknownEvent> {
        Event::try_from(self.key.as_slice())
    }

    /// Decode the payload as an envelope.
    pub fn envelope(&self) -> Result<EventEnvelope, ReadError> {
        EventEnvelope::from_json(&self.value).map_err(|e| self.malformed(e.to_string()))
    }

    /// The offset to commit once this message has been processed.
    pub fn next_offset(&self) -> Offset {
        self.offset + 1
    }

    pub(crate) fn malformed(&self, reason: String) -> ReadError {
        ReadError::Malformed {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            reason,
        }
    }
}

/// Where a published record landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub partition: Partition,
    /// Assigned offset, when the backend reports it
    pub offset: Option<Offset>,
}

/// An outgoing record.
#[derive(Clone, Debug)]
pub struct Record<'a> {
    pub topic: &'a str,
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub headers: &'a [(&'a str, &'a [u8])],
}

/// Stable key hash used to pick a partition (FNV-1a).
pub fn partition_for(key: &[u8], partitions: usize) -> Partition {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    if partitions <= 1 {
        return 0;
    }
    let hash = key
        .iter()
        .fold(OFFSET_BASIS, |h, b| (h ^ u64::from(*b)).wrapping_mul(PRIME));
    (hash % partitions as u64) as Partition
}
