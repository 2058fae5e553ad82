//! Consumer-group generations and the manager that tracks them.
//!
//! A generation is one epoch of group membership: which member owns which
//! partition, and from which offset it starts. Every join, leave, or session
//! timeout ends the current generation. A `Generation` is never updated in
//! place; the manager swaps in a new `Arc<Generation>` after each rebalance, so a
//! holder of an older one keeps a consistent (stale) snapshot and must re-fetch.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::cancel::CancellationToken;
use super::error::GroupError;
use super::group::GroupCoordinator;
use super::message::{Offset, Partition};
use super::retry::reconnect_backoff;

/// Broker-assigned generation token. Opaque apart from equality and ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ownership of one partition within a generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub member_id: String,
    /// Committed offset when the generation started (next record to read)
    pub offset: Offset,
}

/// A snapshot of group membership and partition ownership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    pub epoch: GenerationId,
    /// This member's id within the group
    pub member_id: String,
    /// topic -> partition -> owner
    pub assignments: BTreeMap<String, BTreeMap<Partition, Assignment>>,
}

impl Generation {
    /// Partitions of `topic` owned by this member, with their starting offsets.
    pub fn owned(&self, topic: &str) -> Vec<(Partition, Offset)> {
        self.assignments
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .filter(|(_, a)| a.member_id == self.member_id)
                    .map(|(p, a)| (*p, a.offset))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn owns(&self, topic: &str, partition: Partition) -> bool {
        self.assignments
            .get(topic)
            .and_then(|partitions| partitions.get(&partition))
            .is_some_and(|a| a.member_id == self.member_id)
    }
}

/// Tracks the current generation for one group member and scopes offset commits
/// to it.
pub struct GenerationManager<C: GroupCoordinator> {
    coordinator: C,
    current: RwLock<Option<Arc<Generation>>>,
    /// Highest offset committed from this process, per (topic, partition)
    committed: Mutex<HashMap<(String, Partition), Offset>>,
    poll_interval: Duration,
    /// Held across each join so `close` cannot interleave with one
    closed: Mutex<bool>,
}

impl<C: GroupCoordinator> GenerationManager<C> {
    pub fn new(coordinator: C, poll_interval: Duration) -> Self {
        Self {
            coordinator,
            current: RwLock::new(None),
            committed: Mutex::new(HashMap::new()),
            poll_interval,
            closed: Mutex::new(false),
        }
    }

    pub fn group_id(&self) -> &str {
        self.coordinator.group_id()
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<(), GroupError> {
        if self.is_closed() {
            return Err(GroupError::Closed);
        }
        Ok(())
    }

    /// The generation this member currently holds, if any.
    pub fn current(&self) -> Option<Arc<Generation>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Block until the coordinator admits this member into a generation.
    ///
    /// Waits in slices of the poll interval, so cancellation is observed within
    /// one interval. An unavailable coordinator is retried with backoff. Returns
    /// `GroupError::Closed` once the manager has been closed.
    pub fn join_or_advance_generation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Generation>, GroupError> {
        let backoff = reconnect_backoff();
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(GroupError::Cancelled);
            }

            let pending = {
                let closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
                if *closed {
                    return Err(GroupError::Closed);
                }
                match self.coordinator.join(self.poll_interval) {
                    Ok(Some(generation)) => {
                        let generation = Arc::new(generation);
                        self.install(Arc::clone(&generation));
                        return Ok(generation);
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                }
            };

            match pending {
                Ok(()) => failures = 0,
                Err(GroupError::CoordinatorUnavailable(reason)) => {
                    let delay = backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        group = self.group_id(),
                        %reason,
                        retry_in = ?delay,
                        "group coordinator unavailable"
                    );
                    if cancel.sleep(delay) {
                        return Err(GroupError::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn install(&self, generation: Arc<Generation>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let previous = current.as_ref().map(|g| g.epoch);
        info!(
            group = self.group_id(),
            member = %generation.member_id,
            generation = %generation.epoch,
            ?previous,
            "joined generation"
        );

        // Offsets restart from what the broker handed out for the new epoch.
        let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        for (topic, partitions) in &generation.assignments {
            for (partition, assignment) in partitions {
                if assignment.member_id == generation.member_id {
                    committed.insert((topic.clone(), *partition), assignment.offset);
                }
            }
        }

        *current = Some(generation);
    }

    /// Partitions of `topic` this member owns in `generation` and where each starts.
    pub fn current_assignment(&self, generation: &Generation, topic: &str) -> Vec<(Partition, Offset)> {
        generation.owned(topic)
    }

    /// Persist progress for one partition.
    ///
    /// `generation` must be the one this member currently holds, and `offset`
    /// must not be lower than the last offset committed for the partition.
    pub fn commit_offset(
        &self,
        generation: &Generation,
        topic: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<(), GroupError> {
        self.ensure_open()?;
        let current = self.current().map(|g| g.epoch);
        if current != Some(generation.epoch) {
            return Err(GroupError::StaleGeneration {
                held: generation.epoch,
                current,
            });
        }
        if !generation.owns(topic, partition) {
            return Err(GroupError::NotAssigned {
                topic: topic.to_string(),
                partition,
            });
        }

        let key = (topic.to_string(), partition);
        let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&last) = committed.get(&key) {
            if offset < last {
                return Err(GroupError::OffsetRegression {
                    topic: topic.to_string(),
                    partition,
                    committed: last,
                    requested: offset,
                });
            }
        }

        self.coordinator
            .commit(generation, topic, partition, offset)
            .inspect_err(|e| {
                warn!(
                    group = self.group_id(),
                    topic,
                    partition,
                    offset,
                    generation = %generation.epoch,
                    error = %e,
                    "offset commit failed"
                )
            })?;
        committed.insert(key, offset);
        debug!(group = self.group_id(), topic, partition, offset, "offset committed");
        Ok(())
    }

    /// Committed offset of partition 0 of `topic` for `group`.
    pub fn get_offset(&self, topic: &str, group: &str) -> Result<Offset, GroupError> {
        self.get_offsets(topic, group)?
            .get(&0)
            .copied()
            .ok_or_else(|| GroupError::NoCommittedOffset {
                topic: topic.to_string(),
                group: group.to_string(),
            })
    }

    /// Committed offsets of every partition of `topic` for `group`.
    pub fn get_offsets(&self, topic: &str, group: &str) -> Result<BTreeMap<Partition, Offset>, GroupError> {
        self.ensure_open()?;
        self.coordinator.committed(topic, group)
    }

    /// Seek the group's committed position outside the managed loop, e.g. to
    /// replay from a known-good point.
    pub fn set_offset(&self, topic: &str, partition: Partition, offset: Offset) -> Result<(), GroupError> {
        self.ensure_open()?;
        self.coordinator.reset_offset(topic, partition, offset)?;
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((topic.to_string(), partition), offset);
        info!(group = self.group_id(), topic, partition, offset, "group offset reset");
        Ok(())
    }

    /// Leave the group and forget the current generation. A no-op once closed.
    pub fn leave(&self) -> Result<(), GroupError> {
        if self.is_closed() {
            return Ok(());
        }
        self.current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.coordinator.leave()
    }

    /// Leave the group for good. Later joins, commits, and offset calls fail
    /// with `GroupError::Closed`.
    pub fn close(&self) -> Result<(), GroupError> {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        info!(group = self.group_id(), "group membership closed");
        self.coordinator.leave()
    }
}
