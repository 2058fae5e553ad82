//! Order lifecycle events.
//!
//! - `Event` - the closed set of event kinds and the status state machine
//! - `Coffee` / `Order` - the values carried inside events
//! - `EventEnvelope` - what actually goes on the bus
//! - `OrderTracker` - consumer-side status projection that tolerates
//!   duplicates and reordering
//!
//! ```text
//! received -> accepted -> processing -> processed -> delivered
//! received -> rejected            (coffee_not_available is a rejection reason)
//! accepted/processing -> failed
//! ```

mod envelope;
mod kind;
mod order;
mod tracker;

pub use envelope::{EventEnvelope, EventIds};
pub use kind::{Event, UnknownEvent};
pub use order::{Coffee, Order, TransitionError};
pub use tracker::{Anomaly, Observation, OrderTracker};
