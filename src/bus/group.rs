//! Client side of the broker's consumer-group protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use super::error::{GroupError, ReadError};
use super::generation::Generation;
use super::message::{Message, Offset, Partition};

/// One member's connection to a consumer-group coordinator.
///
/// The broker decides which partitions this member owns. Ownership is granted per
/// generation and can be revoked at any time by a rebalance, which surfaces as
/// `ReadError::GenerationEnded` from `fetch`.
pub trait GroupCoordinator: Send + Sync {
    /// The consumer group this member belongs to.
    fn group_id(&self) -> &str;

    /// Ask to be admitted to the next generation, waiting at most `wait`.
    ///
    /// `Ok(None)` means the rebalance has not completed yet; call again. Joining
    /// during a rebalance signals that this member is done with its previous
    /// generation. Joining while the group is stable returns the current one.
    fn join(&self, wait: Duration) -> Result<Option<Generation>, GroupError>;

    /// Next record from a partition owned in `generation`.
    fn fetch(&self, generation: &Generation, timeout: Duration) -> Result<Message, ReadError>;

    /// Durably record progress for one partition under `generation`.
    fn commit(
        &self,
        generation: &Generation,
        topic: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<(), GroupError>;

    /// Committed offsets of `group` for `topic`, keyed by partition.
    fn committed(&self, topic: &str, group: &str)
        -> Result<BTreeMap<Partition, Offset>, GroupError>;

    /// Overwrite this group's committed offset outside any generation.
    fn reset_offset(&self, topic: &str, partition: Partition, offset: Offset)
        -> Result<(), GroupError>;

    /// Leave the group so the remaining members rebalance without waiting for a
    /// session timeout.
    fn leave(&self) -> Result<(), GroupError>;
}
