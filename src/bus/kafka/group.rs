use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientConfig, ClientContext, Offset as KafkaOffset, TopicPartitionList};
use tracing::{info, warn};

use super::{coordinator_error, group_error, read_error, to_message, METADATA_TIMEOUT};
use crate::bus::connector::BusConfig;
use crate::bus::error::{GroupError, ReadError};
use crate::bus::generation::{Assignment, Generation, GenerationId};
use crate::bus::group::GroupCoordinator;
use crate::bus::message::{Message, Offset, Partition};

const JOIN_SLICE: Duration = Duration::from_millis(100);

/// Counts partition assignments; each one is a new generation.
#[derive(Default)]
pub struct GroupContext {
    epoch: AtomicU64,
    revoked: AtomicBool,
    assigned: Mutex<Vec<(String, Partition)>>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            self.revoked.store(true, Ordering::SeqCst);
            info!(partitions = partitions.count(), "partitions revoked");
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                *self.assigned.lock().unwrap_or_else(|e| e.into_inner()) = partitions
                    .elements()
                    .iter()
                    .map(|e| (e.topic().to_string(), e.partition()))
                    .collect();
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                self.revoked.store(false, Ordering::SeqCst);
                info!(generation = epoch, partitions = partitions.count(), "partitions assigned");
            }
            Rebalance::Revoke(_) => {
                self.assigned.lock().unwrap_or_else(|e| e.into_inner()).clear();
            }
            Rebalance::Error(_) => warn!("rebalance failed"),
        }
    }
}

/// Kafka consumer-group member.
///
/// The broker's own generation id is not exposed by librdkafka, so generations
/// are numbered locally, one per assignment. The broker still checks its own
/// generation on every commit.
pub struct KafkaGroup {
    group_id: String,
    member_id: String,
    topic: String,
    client: ClientConfig,
    consumer: BaseConsumer<GroupContext>,
    subscribed: AtomicBool,
    /// Records polled while joining, tagged with the generation they arrived in
    pending: Mutex<VecDeque<(u64, Message)>>,
}

impl KafkaGroup {
    pub fn new(mut client: ClientConfig, config: &BusConfig) -> KafkaResult<Self> {
        client
            .set("group.id", config.group_id.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");
        let consumer: BaseConsumer<GroupContext> =
            client.create_with_context(GroupContext::default())?;
        consumer.subscribe(&[config.topic.as_str()])?;

        Ok(Self {
            group_id: config.group_id.clone(),
            member_id: config.client_id.clone(),
            topic: config.topic.clone(),
            client,
            consumer,
            subscribed: AtomicBool::new(true),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    fn epoch(&self) -> u64 {
        self.consumer.context().epoch.load(Ordering::SeqCst)
    }

    fn revoked(&self) -> bool {
        self.consumer.context().revoked.load(Ordering::SeqCst)
    }

    fn ended(&self, generation: &Generation) -> bool {
        self.revoked() || generation.epoch != GenerationId(self.epoch())
    }

    fn snapshot(&self, epoch: u64) -> Result<Generation, GroupError> {
        let committed = self
            .consumer
            .committed(METADATA_TIMEOUT)
            .map_err(coordinator_error)?;

        let mut assignments: BTreeMap<String, BTreeMap<Partition, Assignment>> = BTreeMap::new();
        let assigned = self
            .consumer
            .context()
            .assigned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (topic, partition) in assigned {
            let offset = match committed
                .find_partition(&topic, partition)
                .map(|e| e.offset())
            {
                Some(KafkaOffset::Offset(offset)) => offset,
                _ => 0,
            };
            assignments.entry(topic).or_default().insert(
                partition,
                Assignment {
                    member_id: self.member_id.clone(),
                    offset,
                },
            );
        }

        Ok(Generation {
            epoch: GenerationId(epoch),
            member_id: self.member_id.clone(),
            assignments,
        })
    }

    /// A consumer outside the group's membership, for offset admin.
    fn admin_consumer(&self, group: &str) -> Result<BaseConsumer, GroupError> {
        let mut client = self.client.clone();
        client.set("group.id", group);
        client.create().map_err(coordinator_error)
    }
}

fn committed_for<X: ConsumerContext + 'static>(
    consumer: &BaseConsumer<X>,
    topic: &str,
) -> Result<BTreeMap<Partition, Offset>, GroupError> {
    let metadata = consumer
        .fetch_metadata(Some(topic), METADATA_TIMEOUT)
        .map_err(coordinator_error)?;
    let mut partitions = TopicPartitionList::new();
    for t in metadata.topics().iter().filter(|t| t.name() == topic) {
        for p in t.partitions() {
            partitions.add_partition(topic, p.id());
        }
    }

    let committed = consumer
        .committed_offsets(partitions, METADATA_TIMEOUT)
        .map_err(coordinator_error)?;
    Ok(committed
        .elements()
        .iter()
        .filter_map(|e| match e.offset() {
            KafkaOffset::Offset(offset) => Some((e.partition(), offset)),
            _ => None,
        })
        .collect())
}

impl GroupCoordinator for KafkaGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn join(&self, wait: Duration) -> Result<Option<Generation>, GroupError> {
        if !self.subscribed.load(Ordering::SeqCst) {
            self.consumer
                .subscribe(&[self.topic.as_str()])
                .map_err(coordinator_error)?;
            self.subscribed.store(true, Ordering::SeqCst);
        }
        let deadline = Instant::now() + wait;
        loop {
            let epoch = self.epoch();
            if epoch > 0 && !self.revoked() {
                return self.snapshot(epoch).map(Some);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.consumer.poll(remaining.min(JOIN_SLICE)) {
                Some(Ok(message)) => {
                    let message = to_message(&message);
                    self.pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back((self.epoch(), message));
                }
                Some(Err(e)) => {
                    warn!(group = %self.group_id, error = %e, "poll failed while joining");
                    if let ReadError::ConnectionLost(reason) = read_error(e) {
                        return Err(GroupError::CoordinatorUnavailable(reason));
                    }
                }
                None => {}
            }
        }
    }

    fn fetch(&self, generation: &Generation, timeout: Duration) -> Result<Message, ReadError> {
        if self.ended(generation) {
            return Err(ReadError::GenerationEnded);
        }

        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            // Stale entries are refetched from the committed offset after reassignment.
            while let Some((epoch, message)) = pending.pop_front() {
                if GenerationId(epoch) == generation.epoch {
                    return Ok(message);
                }
            }
        }

        match self.consumer.poll(timeout) {
            Some(Ok(message)) => {
                let message = to_message(&message);
                if self.ended(generation) {
                    self.pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back((self.epoch(), message));
                    return Err(ReadError::GenerationEnded);
                }
                Ok(message)
            }
            Some(Err(e)) => Err(read_error(e)),
            None if self.ended(generation) => Err(ReadError::GenerationEnded),
            None => Err(ReadError::Timeout),
        }
    }

    fn commit(
        &self,
        generation: &Generation,
        topic: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<(), GroupError> {
        let current = GenerationId(self.epoch());
        if generation.epoch != current {
            return Err(GroupError::StaleGeneration {
                held: generation.epoch,
                current: Some(current),
            });
        }

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, KafkaOffset::Offset(offset))
            .map_err(|e| group_error(e, generation.epoch))?;
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| group_error(e, generation.epoch))
    }

    fn committed(&self, topic: &str, group: &str) -> Result<BTreeMap<Partition, Offset>, GroupError> {
        if group == self.group_id {
            committed_for(&self.consumer, topic)
        } else {
            committed_for(&self.admin_consumer(group)?, topic)
        }
    }

    fn reset_offset(&self, topic: &str, partition: Partition, offset: Offset) -> Result<(), GroupError> {
        let admin = self.admin_consumer(&self.group_id)?;
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, KafkaOffset::Offset(offset))
            .map_err(coordinator_error)?;
        // Accepted by the broker only while the group has no active members.
        admin
            .commit(&offsets, CommitMode::Sync)
            .map_err(coordinator_error)
    }

    fn leave(&self) -> Result<(), GroupError> {
        self.consumer.unsubscribe();
        self.subscribed.store(false, Ordering::SeqCst);
        // The next join must wait for a fresh assignment.
        self.consumer.context().revoked.store(true, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
