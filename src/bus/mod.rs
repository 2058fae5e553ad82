//! Event Bus - publishing and consuming order events over a partitioned log
//!
//! This module provides the traits a broker backend implements and the
//! `EventBus` facade that composes them for one topic.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   EventBus (per topic)                      │
//! │  - publish() / publish_order() / publish_with_retry()       │
//! │  - read_next()          (no group: every partition)         │
//! │  - run_managed_loop()   (group: owned partitions only)      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                     │
//!          ▼                  ▼                     ▼
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────────────┐
//! │  Publisher  │    │   Reader    │    │  GenerationManager  │
//! │             │    │             │    │  + GroupCoordinator │
//! └─────────────┘    └─────────────┘    └─────────────────────┘
//!          │                  │                     │
//!          └──────────────────┼─────────────────────┘
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Connector (backend)                     │
//! │   InMemoryBroker (included)    KafkaConnector (`kafka`)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Generations
//!
//! A consumer group hands out partitions per generation. When membership
//! changes, fetches fail with `ReadError::GenerationEnded`; the managed loop
//! commits what it has read under the ending generation and joins the next one.
//! A commit made with anything but the current generation is refused with
//! `GroupError::StaleGeneration`.
//!
//! ## Usage
//!
//! ```ignore
//! let bus = EventBus::connect(config.with_group("baristas"), &KafkaConnector::new())?;
//! let handle = bus.run_managed_loop(|envelope: &EventEnvelope| {
//!     tracker.lock().unwrap().observe(envelope);
//!     Ok::<_, String>(())
//! })?;
//! // ...
//! bus.close()?;
//! ```

mod cancel;
mod connector;
mod error;
mod event_bus;
mod generation;
mod group;
mod in_memory;
#[cfg(feature = "kafka")]
mod kafka;
mod managed;
mod message;
mod publisher;
mod reader;
mod retry;

pub use cancel::CancellationToken;
pub(crate) use connector::is_host_port;
pub use connector::{BusConfig, Connector, DEFAULT_POLL_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT};
pub use error::{ConnectError, GroupError, PublishError, ReadError, ShutdownError};
pub use event_bus::EventBus;
pub use generation::{Assignment, Generation, GenerationId, GenerationManager};
pub use group::GroupCoordinator;
pub use in_memory::{CommitRecord, InMemoryBroker, InMemoryGroup, InMemoryPublisher, InMemoryReader};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConnector, KafkaGroup, KafkaPublisher, KafkaReader};
pub use managed::{LoopStats, ManagedLoopHandle, COMMIT_EVERY};
pub use message::{partition_for, Delivery, Message, Offset, Partition, Record, EVENT_HEADER};
pub use publisher::Publisher;
pub use reader::Reader;
pub use retry::RetryPolicy;
