//! Consumer-side view of order status.
//!
//! The bus delivers at least once and gives no ordering across partitions, so a
//! consumer will see duplicates and the occasional out-of-order event. The tracker
//! applies what is valid and logs the rest without ever moving an order backwards.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::envelope::EventEnvelope;
use super::kind::Event;
use super::order::Order;

/// Why an envelope was not applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Anomaly {
    /// First sighting of the order was not `order_received`.
    UnknownOrder,
    /// The order is already in the status this event leads to.
    Duplicate,
    /// Applying the event would move the order backwards.
    Regression,
    /// The order already reached a terminal status.
    AfterTerminal,
    /// Forward, but not along a defined edge (e.g. accepted -> delivered).
    InvalidTransition,
}

/// The outcome of observing one envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    Created,
    Advanced { from: Event, to: Event },
    Skipped(Anomaly),
}

/// Tracks the last known status of every order seen on the bus.
#[derive(Debug, Default)]
pub struct OrderTracker {
    orders: HashMap<i64, Order>,
    anomalies: usize,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an envelope if it is a valid next step for its order.
    pub fn observe(&mut self, envelope: &EventEnvelope) -> Observation {
        let order_id = envelope.order.order_id;
        let kind = envelope.kind;

        let observation = if let Some(order) = self.orders.get_mut(&order_id) {
            let from = order.status;
            match order.transition(kind) {
                Ok(()) => Observation::Advanced {
                    from,
                    to: order.status,
                },
                Err(_) => Observation::Skipped(classify(from, kind)),
            }
        } else if kind == Event::OrderReceived {
            self.orders
                .insert(order_id, Order::new(order_id, envelope.order.item.clone()));
            Observation::Created
        } else {
            Observation::Skipped(Anomaly::UnknownOrder)
        };

        match observation {
            Observation::Skipped(anomaly) => {
                self.anomalies += 1;
                warn!(
                    order_id,
                    event_id = envelope.event_id,
                    kind = %kind,
                    status = self.orders.get(&order_id).map(|o| o.status.as_str()),
                    ?anomaly,
                    "skipping out-of-sequence order event"
                );
            }
            _ => debug!(order_id, kind = %kind, "order status updated"),
        }

        observation
    }

    pub fn status(&self, order_id: i64) -> Option<Event> {
        self.orders.get(&order_id).map(|o| o.status)
    }

    pub fn order(&self, order_id: i64) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Number of envelopes skipped so far.
    pub fn anomalies(&self) -> usize {
        self.anomalies
    }
}

fn classify(status: Event, kind: Event) -> Anomaly {
    if status.is_terminal() {
        Anomaly::AfterTerminal
    } else if kind.resulting_status() == status {
        Anomaly::Duplicate
    } else if kind.regresses(status) {
        Anomaly::Regression
    } else {
        Anomaly::InvalidTransition
    }
}
