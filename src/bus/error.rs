//! Error types for bus operations.

use std::time::Duration;

use thiserror::Error;

use super::generation::GenerationId;
use crate::event::TransitionError;
use super::message::{Offset, Partition};

/// Error returned when publishing.
///
/// Never retried internally: blind retry without idempotency keys risks duplicate
/// delivery, so retrying is the caller's decision (see `RetryPolicy`).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PublishError {
    /// The bus has been closed.
    #[error("publisher closed")]
    Closed,
    /// The connection to the broker dropped before the write was acknowledged.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The broker refused the write (unknown topic, authorization, size).
    #[error("broker rejected message: {0}")]
    BrokerRejected(String),
    /// The payload could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The order's status does not match the event being published.
    #[error(transparent)]
    InvalidEvent(#[from] TransitionError),
}

impl PublishError {
    /// Whether a caller retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::ConnectionLost(_))
    }
}

/// Error returned when reading.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ReadError {
    /// No message arrived before the deadline.
    #[error("read timed out")]
    Timeout,
    /// The connection dropped; reconnecting may succeed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The reader has been torn down.
    #[error("reader closed")]
    Closed,
    /// The consumer group started rebalancing; commit and rejoin before reading on.
    #[error("generation ended")]
    GenerationEnded,
    /// The message did not decode as an event envelope.
    #[error("malformed message at {topic}/{partition}@{offset}: {reason}")]
    Malformed {
        topic: String,
        partition: Partition,
        offset: Offset,
        reason: String,
    },
    /// `read_next` was called on a bus bound to a consumer group.
    #[error("bus is bound to consumer group {0}; use run_managed_loop")]
    ManagedMode(String),
}

impl ReadError {
    /// Whether the caller may keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReadError::Timeout | ReadError::ConnectionLost(_) | ReadError::Malformed { .. }
        )
    }
}

/// Error returned by consumer-group operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum GroupError {
    /// The generation used is no longer the group's current one. Rejoin, then retry.
    #[error("stale generation {held} (current {current:?})")]
    StaleGeneration {
        held: GenerationId,
        current: Option<GenerationId>,
    },
    /// The group coordinator could not be reached; back off and retry.
    #[error("group coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),
    /// A commit would move a partition's committed offset backwards.
    #[error("offset regression on {topic}/{partition}: committed {committed}, requested {requested}")]
    OffsetRegression {
        topic: String,
        partition: Partition,
        committed: Offset,
        requested: Offset,
    },
    /// The partition is not owned by this member in the given generation.
    #[error("{topic}/{partition} is not assigned to this member")]
    NotAssigned { topic: String, partition: Partition },
    /// Nothing has been committed for this topic and group.
    #[error("no committed offset for {topic} in group {group}")]
    NoCommittedOffset { topic: String, group: String },
    /// The coordinator refused the request for another reason.
    #[error("group request rejected: {0}")]
    Rejected(String),
    /// The wait was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// The bus has been closed.
    #[error("group membership closed")]
    Closed,
}

impl GroupError {
    /// Whether the right response is to rejoin the group rather than retry.
    pub fn requires_rejoin(&self) -> bool {
        matches!(self, GroupError::StaleGeneration { .. })
    }
}

/// Error returned when building a bus.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("invalid bus configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to connect to {brokers:?}: {reason}")]
    Backend {
        brokers: Vec<String>,
        reason: String,
    },
}

/// Error returned when closing a bus.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ShutdownError {
    /// Some consumer loops did not stop within the deadline.
    #[error("shutdown deadline {deadline:?} exceeded; stuck: {stuck:?}")]
    DeadlineExceeded {
        deadline: Duration,
        stuck: Vec<String>,
    },
}
