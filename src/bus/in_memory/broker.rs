//! In-memory partitioned log with a consumer-group coordinator.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::bus::error::{GroupError, PublishError, ReadError};
use crate::bus::generation::{Assignment, Generation, GenerationId};
use crate::bus::message::{partition_for, Delivery, Message, Offset, Partition, Record};

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a waiter sleeps before re-checking member liveness.
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// In-memory broker for tests and single-process use.
///
/// Features:
/// - Thread-safe (clones share the same log and groups)
/// - Topics split into partitions; records are routed by key hash
/// - Consumer groups with generations, range assignment, and session timeouts
/// - Fault injection: broker outage, lost acknowledgements, forced rebalances
///
/// ## Example
///
/// ```
/// use cafebucks::bus::InMemoryBroker;
///
/// let broker = InMemoryBroker::new().with_topic("orders", 3);
/// assert_eq!(broker.partitions("orders"), Some(3));
/// assert!(broker.is_empty("orders"));
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

struct State {
    topics: HashMap<String, Vec<Vec<Stored>>>,
    groups: HashMap<String, GroupState>,
    available: bool,
    dropped_acks: usize,
    session_timeout: Duration,
    next_member: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            groups: HashMap::new(),
            available: true,
            dropped_acks: 0,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            next_member: 0,
        }
    }
}

#[derive(Clone)]
struct Stored {
    key: Vec<u8>,
    value: Vec<u8>,
    headers: Vec<(String, Vec<u8>)>,
}

/// A commit accepted by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitRecord {
    pub member_id: String,
    pub generation: GenerationId,
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
}

#[derive(Default)]
struct GroupState {
    /// Current generation; 0 until the first rebalance completes
    epoch: u64,
    rebalancing: bool,
    members: BTreeMap<String, Member>,
    /// topic -> partition -> owning member
    assignments: BTreeMap<String, BTreeMap<Partition, String>>,
    committed: HashMap<(String, Partition), Offset>,
    commit_log: Vec<CommitRecord>,
}

struct Member {
    topics: Vec<String>,
    last_seen: Instant,
    /// Has asked to join the pending generation
    rejoined: bool,
    generation: Option<u64>,
}

impl GroupState {
    fn begin_rebalance(&mut self) {
        self.rebalancing = true;
        for member in self.members.values_mut() {
            member.rejoined = false;
        }
    }

    /// Drop members whose session lapsed. Returns whether any were dropped.
    fn expire(&mut self, now: Instant, session_timeout: Duration) -> bool {
        let before = self.members.len();
        self.members
            .retain(|_, m| now.duration_since(m.last_seen) <= session_timeout);
        let expired = self.members.len() != before;
        if expired {
            self.begin_rebalance();
        }
        expired
    }

    /// Finish the rebalance once every member has rejoined.
    fn try_complete(&mut self, topics: &HashMap<String, Vec<Vec<Stored>>>) -> bool {
        if !self.rebalancing
            || self.members.is_empty()
            || !self.members.values().all(|m| m.rejoined)
        {
            return false;
        }

        self.epoch += 1;
        self.assignments = range_assign(&self.members, topics);
        for member in self.members.values_mut() {
            member.rejoined = false;
            member.generation = Some(self.epoch);
        }
        self.rebalancing = false;
        true
    }

    fn snapshot(&self, member_id: &str) -> Generation {
        let assignments = self
            .assignments
            .iter()
            .map(|(topic, partitions)| {
                let owners = partitions
                    .iter()
                    .map(|(partition, owner)| {
                        let offset = self
                            .committed
                            .get(&(topic.clone(), *partition))
                            .copied()
                            .unwrap_or(0);
                        (
                            *partition,
                            Assignment {
                                member_id: owner.clone(),
                                offset,
                            },
                        )
                    })
                    .collect();
                (topic.clone(), owners)
            })
            .collect();

        Generation {
            epoch: GenerationId(self.epoch),
            member_id: member_id.to_string(),
            assignments,
        }
    }
}

/// Split each topic's partitions into contiguous ranges over the sorted members
/// subscribed to it.
fn range_assign(
    members: &BTreeMap<String, Member>,
    topics: &HashMap<String, Vec<Vec<Stored>>>,
) -> BTreeMap<String, BTreeMap<Partition, String>> {
    let mut by_topic: BTreeMap<String, Vec<&String>> = BTreeMap::new();
    for (id, member) in members {
        for topic in &member.topics {
            by_topic.entry(topic.clone()).or_default().push(id);
        }
    }

    let mut assignments = BTreeMap::new();
    for (topic, subscribers) in by_topic {
        let partitions = topics.get(&topic).map_or(0, Vec::len);
        let per_member = partitions / subscribers.len();
        let extra = partitions % subscribers.len();

        let mut owners = BTreeMap::new();
        let mut next = 0;
        for (i, member) in subscribers.iter().enumerate() {
            let count = per_member + usize::from(i < extra);
            for partition in next..next + count {
                owners.insert(partition as Partition, (*member).clone());
            }
            next += count;
        }
        assignments.insert(topic, owners);
    }
    assignments
}

/// First unread record among `positions`, visited starting at index `start`.
fn next_record(
    topics: &HashMap<String, Vec<Vec<Stored>>>,
    positions: &[(String, Partition, Offset)],
    start: usize,
) -> Option<Message> {
    let n = positions.len();
    (0..n).find_map(|i| {
        let (topic, partition, offset) = &positions[(start + i) % n];
        let log = topics.get(topic)?.get(*partition as usize)?;
        let stored = log.get(usize::try_from(*offset).ok()?)?;
        Some(Message {
            topic: topic.clone(),
            partition: *partition,
            offset: *offset,
            key: stored.key.clone(),
            value: stored.value.clone(),
            headers: stored.headers.clone(),
        })
    })
}

impl InMemoryBroker {
    /// Create an empty broker with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of `create_topic`.
    pub fn with_topic(self, name: &str, partitions: usize) -> Self {
        self.create_topic(name, partitions);
        self
    }

    /// How long a group member may stay silent before it is dropped.
    pub fn with_session_timeout(self, timeout: Duration) -> Self {
        self.lock().session_timeout = timeout;
        self
    }

    /// Create a topic with `partitions` partitions (at least one). Existing
    /// topics are left as they are.
    pub fn create_topic(&self, name: &str, partitions: usize) {
        self.lock()
            .topics
            .entry(name.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    /// Number of partitions of `topic`, if it exists.
    pub fn partitions(&self, topic: &str) -> Option<usize> {
        self.lock().topics.get(topic).map(Vec::len)
    }

    /// Every record of `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Message> {
        let state = self.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, stored)| Message {
                    topic: topic.to_string(),
                    partition: partition as Partition,
                    offset: offset as Offset,
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                    headers: stored.headers.clone(),
                })
            })
            .collect()
    }

    /// Total number of records in `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum())
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Simulate an outage. While unavailable every client call fails with a
    /// connection or coordinator error.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
        self.shared.changed.notify_all();
    }

    /// Store the next published record but report the write as lost, as if the
    /// connection dropped between the broker's append and its acknowledgement.
    pub fn drop_next_ack(&self) {
        self.lock().dropped_acks += 1;
    }

    /// End the current generation of `group`, as a membership change would.
    pub fn force_rebalance(&self, group: &str) {
        let mut state = self.lock();
        if let Some(group_state) = state.groups.get_mut(group) {
            group_state.begin_rebalance();
            info!(group, generation = group_state.epoch, "rebalance forced");
        }
        self.shared.changed.notify_all();
    }

    /// Current generation of `group`, once one has formed.
    pub fn generation(&self, group: &str) -> Option<GenerationId> {
        self.lock()
            .groups
            .get(group)
            .filter(|g| g.epoch > 0)
            .map(|g| GenerationId(g.epoch))
    }

    /// Whether `group` is between generations.
    pub fn is_rebalancing(&self, group: &str) -> bool {
        self.lock().groups.get(group).is_some_and(|g| g.rebalancing)
    }

    /// Ids of the live members of `group`.
    pub fn members(&self, group: &str) -> Vec<String> {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed offset of `group` for one partition.
    pub fn committed(&self, group: &str, topic: &str, partition: Partition) -> Option<Offset> {
        self.lock()
            .groups
            .get(group)?
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Every commit `group` has accepted, in order.
    pub fn commit_log(&self, group: &str) -> Vec<CommitRecord> {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.commit_log.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Run `step` under the lock until it yields a result or `timeout` elapses.
    fn wait_for<T>(
        &self,
        timeout: Duration,
        mut step: impl FnMut(&mut State) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(done) = step(&mut state) {
                return Some(done);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            state = self
                .shared
                .changed
                .wait_timeout(state, slice)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Fresh member id for a client, unique within this broker.
    pub(crate) fn member_id(&self, client_id: &str) -> String {
        let mut state = self.lock();
        state.next_member += 1;
        format!("{client_id}-{}", state.next_member)
    }

    pub(crate) fn append(&self, record: &Record<'_>) -> Result<Delivery, PublishError> {
        let mut state = self.lock();
        if !state.available {
            return Err(PublishError::ConnectionLost("broker unavailable".into()));
        }
        let partitions = state
            .topics
            .get_mut(record.topic)
            .ok_or_else(|| PublishError::BrokerRejected(format!("unknown topic {}", record.topic)))?;

        let partition = partition_for(record.key, partitions.len());
        let log = &mut partitions[partition as usize];
        log.push(Stored {
            key: record.key.to_vec(),
            value: record.value.to_vec(),
            headers: record
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        });
        let offset = (log.len() - 1) as Offset;
        self.shared.changed.notify_all();

        if state.dropped_acks > 0 {
            state.dropped_acks -= 1;
            return Err(PublishError::ConnectionLost(
                "connection reset before acknowledgement".into(),
            ));
        }

        Ok(Delivery {
            partition,
            offset: Some(offset),
        })
    }

    /// Next record of `topic` at or after the given per-partition positions
    /// (missing partitions start at 0).
    pub(crate) fn read(
        &self,
        topic: &str,
        positions: &BTreeMap<Partition, Offset>,
        start: usize,
        timeout: Duration,
    ) -> Result<Message, ReadError> {
        self.wait_for(timeout, |state| {
            if !state.available {
                return Some(Err(ReadError::ConnectionLost("broker unavailable".into())));
            }
            let count = state.topics.get(topic)?.len();
            let cursor: Vec<_> = (0..count as Partition)
                .map(|p| (topic.to_string(), p, positions.get(&p).copied().unwrap_or(0)))
                .collect();
            next_record(&state.topics, &cursor, start).map(Ok)
        })
        .unwrap_or(Err(ReadError::Timeout))
    }

    /// Join `group`, waiting up to `wait` for the rebalance to complete.
    pub(crate) fn join(
        &self,
        group: &str,
        member_id: &str,
        topics: &[String],
        wait: Duration,
    ) -> Result<Option<Generation>, GroupError> {
        let joined = self.wait_for(wait, |state| {
            if !state.available {
                return Some(Err(GroupError::CoordinatorUnavailable(
                    "broker unavailable".into(),
                )));
            }
            let now = Instant::now();
            let session_timeout = state.session_timeout;
            let group_state = state.groups.entry(group.to_string()).or_default();
            group_state.expire(now, session_timeout);

            if !group_state.members.contains_key(member_id) {
                group_state.members.insert(
                    member_id.to_string(),
                    Member {
                        topics: topics.to_vec(),
                        last_seen: now,
                        rejoined: false,
                        generation: None,
                    },
                );
                group_state.begin_rebalance();
                debug!(group, member = member_id, "member joining; rebalance started");
            }

            let epoch = group_state.epoch;
            let rebalancing = group_state.rebalancing;
            if let Some(member) = group_state.members.get_mut(member_id) {
                member.last_seen = now;
                if !rebalancing && member.generation == Some(epoch) {
                    return Some(Ok(group_state.snapshot(member_id)));
                }
                member.rejoined = true;
            }

            if group_state.try_complete(&state.topics) {
                info!(
                    group,
                    generation = group_state.epoch,
                    members = group_state.members.len(),
                    "rebalance complete"
                );
                self.shared.changed.notify_all();
                return Some(Ok(group_state.snapshot(member_id)));
            }
            None
        });

        joined.transpose()
    }

    /// Next record from the partitions in `positions`, valid only while
    /// generation `epoch` is current and stable.
    pub(crate) fn fetch(
        &self,
        group: &str,
        member_id: &str,
        epoch: GenerationId,
        positions: &[(String, Partition, Offset)],
        start: usize,
        timeout: Duration,
    ) -> Result<Message, ReadError> {
        self.wait_for(timeout, |state| {
            if !state.available {
                return Some(Err(ReadError::ConnectionLost("broker unavailable".into())));
            }
            let now = Instant::now();
            let session_timeout = state.session_timeout;
            let Some(group_state) = state.groups.get_mut(group) else {
                return Some(Err(ReadError::GenerationEnded));
            };
            group_state.expire(now, session_timeout);
            let Some(member) = group_state.members.get_mut(member_id) else {
                return Some(Err(ReadError::GenerationEnded));
            };
            member.last_seen = now;
            if group_state.rebalancing || GenerationId(group_state.epoch) != epoch {
                return Some(Err(ReadError::GenerationEnded));
            }
            next_record(&state.topics, positions, start).map(Ok)
        })
        .unwrap_or(Err(ReadError::Timeout))
    }

    pub(crate) fn commit(
        &self,
        group: &str,
        member_id: &str,
        epoch: GenerationId,
        topic: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<(), GroupError> {
        let mut state = self.lock();
        if !state.available {
            return Err(GroupError::CoordinatorUnavailable("broker unavailable".into()));
        }
        let Some(group_state) = state.groups.get_mut(group) else {
            return Err(GroupError::StaleGeneration {
                held: epoch,
                current: None,
            });
        };
        if GenerationId(group_state.epoch) != epoch || !group_state.members.contains_key(member_id) {
            return Err(GroupError::StaleGeneration {
                held: epoch,
                current: Some(GenerationId(group_state.epoch)),
            });
        }
        let owner = group_state
            .assignments
            .get(topic)
            .and_then(|partitions| partitions.get(&partition));
        if owner.map(String::as_str) != Some(member_id) {
            return Err(GroupError::NotAssigned {
                topic: topic.to_string(),
                partition,
            });
        }

        group_state
            .committed
            .insert((topic.to_string(), partition), offset);
        group_state.commit_log.push(CommitRecord {
            member_id: member_id.to_string(),
            generation: epoch,
            topic: topic.to_string(),
            partition,
            offset,
        });
        Ok(())
    }

    pub(crate) fn committed_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<BTreeMap<Partition, Offset>, GroupError> {
        let state = self.lock();
        if !state.available {
            return Err(GroupError::CoordinatorUnavailable("broker unavailable".into()));
        }
        Ok(state
            .groups
            .get(group)
            .map(|g| {
                g.committed
                    .iter()
                    .filter(|((t, _), _)| t == topic)
                    .map(|((_, p), o)| (*p, *o))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Overwrite a committed offset. Refused while the group has live members.
    pub(crate) fn reset_offset(
        &self,
        group: &str,
        topic: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<(), GroupError> {
        let mut state = self.lock();
        if !state.available {
            return Err(GroupError::CoordinatorUnavailable("broker unavailable".into()));
        }
        let partitions = state.topics.get(topic).map_or(0, Vec::len);
        if partition < 0 || partition as usize >= partitions {
            return Err(GroupError::Rejected(format!("unknown partition {topic}/{partition}")));
        }
        let group_state = state.groups.entry(group.to_string()).or_default();
        if !group_state.members.is_empty() {
            return Err(GroupError::Rejected(format!(
                "group {group} has {} active members",
                group_state.members.len()
            )));
        }
        group_state
            .committed
            .insert((topic.to_string(), partition), offset);
        Ok(())
    }

    pub(crate) fn leave(&self, group: &str, member_id: &str) {
        let mut state = self.lock();
        if let Some(group_state) = state.groups.get_mut(group) {
            if group_state.members.remove(member_id).is_some() {
                if group_state.members.is_empty() {
                    group_state.rebalancing = false;
                    group_state.assignments.clear();
                } else {
                    group_state.begin_rebalance();
                }
                info!(group, member = member_id, "member left group");
            }
        }
        self.shared.changed.notify_all();
    }
}
