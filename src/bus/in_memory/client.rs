//! Client handles onto an `InMemoryBroker`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::broker::InMemoryBroker;
use crate::bus::error::{GroupError, PublishError, ReadError};
use crate::bus::generation::{Generation, GenerationId};
use crate::bus::group::GroupCoordinator;
use crate::bus::message::{Delivery, Message, Offset, Partition, Record};
use crate::bus::publisher::Publisher;
use crate::bus::reader::Reader;

pub struct InMemoryPublisher {
    broker: InMemoryBroker,
    closed: AtomicBool,
}

impl InMemoryPublisher {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
        }
    }
}

impl Publisher for InMemoryPublisher {
    fn publish(&self, record: Record<'_>) -> Result<Delivery, PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        self.broker.append(&record)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Reads every partition of one topic from the earliest offset.
pub struct InMemoryReader {
    broker: InMemoryBroker,
    topic: String,
    cursor: Mutex<ReaderCursor>,
    closed: AtomicBool,
}

#[derive(Default)]
struct ReaderCursor {
    positions: BTreeMap<Partition, Offset>,
    /// Partition to look at first on the next read
    rotation: usize,
    /// Bumped on every seek and every delivered read
    version: u64,
}

impl InMemoryReader {
    pub fn new(broker: InMemoryBroker, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
            cursor: Mutex::new(ReaderCursor::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Next offset this reader will return for `partition`.
    pub fn position(&self, partition: Partition) -> Offset {
        self.cursor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .positions
            .get(&partition)
            .copied()
            .unwrap_or(0)
    }
}

impl Reader for InMemoryReader {
    fn read(&self, timeout: Duration) -> Result<Message, ReadError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReadError::Closed);
        }
        let deadline = Instant::now() + timeout;
        loop {
            // Wait on the broker without the cursor lock so `seek` stays responsive.
            let (positions, rotation, version) = {
                let cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
                (cursor.positions.clone(), cursor.rotation, cursor.version)
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = self.broker.read(&self.topic, &positions, rotation, remaining)?;

            let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
            if cursor.version != version {
                // Moved while we waited; the message may be behind the new position.
                if Instant::now() >= deadline {
                    return Err(ReadError::Timeout);
                }
                continue;
            }
            cursor.positions.insert(message.partition, message.next_offset());
            cursor.rotation = message.partition as usize + 1;
            cursor.version += 1;
            return Ok(message);
        }
    }

    fn seek(&self, partition: Partition, offset: Offset) -> Result<(), ReadError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReadError::Closed);
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        cursor.positions.insert(partition, offset.max(0));
        cursor.version += 1;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One member of a consumer group hosted by an `InMemoryBroker`.
///
/// Leaves the group when dropped.
pub struct InMemoryGroup {
    broker: InMemoryBroker,
    group_id: String,
    member_id: String,
    topics: Vec<String>,
    cursor: Mutex<GroupCursor>,
}

#[derive(Default)]
struct GroupCursor {
    /// Generation the positions below belong to
    epoch: Option<GenerationId>,
    positions: Vec<(String, Partition, Offset)>,
    rotation: usize,
}

impl InMemoryGroup {
    pub fn new(
        broker: InMemoryBroker,
        group_id: impl Into<String>,
        client_id: &str,
        topics: Vec<String>,
    ) -> Self {
        let member_id = broker.member_id(client_id);
        Self {
            broker,
            group_id: group_id.into(),
            member_id,
            topics,
            cursor: Mutex::new(GroupCursor::default()),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }
}

impl GroupCoordinator for InMemoryGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn join(&self, wait: Duration) -> Result<Option<Generation>, GroupError> {
        self.broker
            .join(&self.group_id, &self.member_id, &self.topics, wait)
    }

    fn fetch(&self, generation: &Generation, timeout: Duration) -> Result<Message, ReadError> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        if cursor.epoch != Some(generation.epoch) {
            cursor.positions = self
                .topics
                .iter()
                .flat_map(|topic| {
                    generation
                        .owned(topic)
                        .into_iter()
                        .map(move |(partition, offset)| (topic.clone(), partition, offset))
                })
                .collect();
            cursor.epoch = Some(generation.epoch);
            cursor.rotation = 0;
        }

        let message = self.broker.fetch(
            &self.group_id,
            &self.member_id,
            generation.epoch,
            &cursor.positions,
            cursor.rotation,
            timeout,
        )?;

        if let Some(i) = cursor
            .positions
            .iter()
            .position(|(t, p, _)| *t == message.topic && *p == message.partition)
        {
            cursor.positions[i].2 = message.next_offset();
            cursor.rotation = i + 1;
        }
        Ok(message)
    }

    fn commit(
        &self,
        generation: &Generation,
        topic: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<(), GroupError> {
        self.broker.commit(
            &self.group_id,
            &self.member_id,
            generation.epoch,
            topic,
            partition,
            offset,
        )
    }

    fn committed(&self, topic: &str, group: &str) -> Result<BTreeMap<Partition, Offset>, GroupError> {
        self.broker.committed_offsets(group, topic)
    }

    fn reset_offset(&self, topic: &str, partition: Partition, offset: Offset) -> Result<(), GroupError> {
        self.broker
            .reset_offset(&self.group_id, topic, partition, offset)
    }

    fn leave(&self) -> Result<(), GroupError> {
        self.broker.leave(&self.group_id, &self.member_id);
        Ok(())
    }
}

impl Drop for InMemoryGroup {
    fn drop(&mut self) {
        self.broker.leave(&self.group_id, &self.member_id);
    }
}
