//! Order and coffee value types.

use serde::{Deserialize, Serialize};

use super::kind::Event;

/// A coffee on the menu.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coffee {
    pub name: String,
    pub price: f64,
}

impl Coffee {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            name: name.into(),
            price,
        }
    }
}

/// A customer order and its lifecycle status.
///
/// `status` is never `CoffeeNotAvailable`; that kind resolves to `OrderRejected`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub item: Coffee,
    pub status: Event,
}

/// An event kind that is not a valid next step for an order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("order {order_id}: {kind} cannot follow {status}")]
pub struct TransitionError {
    pub order_id: i64,
    pub status: Event,
    pub kind: Event,
}

impl Order {
    /// A freshly received order.
    pub fn new(order_id: i64, item: Coffee) -> Self {
        Self {
            order_id,
            item,
            status: Event::OrderReceived,
        }
    }

    /// Move the order forward by one event.
    pub fn transition(&mut self, kind: Event) -> Result<(), TransitionError> {
        if !kind.can_follow(self.status) {
            return Err(TransitionError {
                order_id: self.order_id,
                status: self.status,
                kind,
            });
        }
        self.status = kind.resulting_status();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
