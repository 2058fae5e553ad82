//! Order lifecycle events over a partitioned log.
//!
//! - [`event`] - event kinds, the order state machine, and the consumer-side tracker
//! - [`bus`] - publisher, reader, consumer-group generations, and the `EventBus` facade
//! - [`config`] / [`logging`] - environment configuration and JSON logs
//! - `http` - order intake over HTTP (`http` feature)

pub mod bus;
pub mod config;
pub mod event;
#[cfg(feature = "http")]
pub mod http;
pub mod logging;

pub use bus::{BusConfig, EventBus, InMemoryBroker};
pub use config::{Config, ConfigError};
pub use event::{Coffee, Event, EventEnvelope, Order, OrderTracker};
