//! Event taxonomy and the order status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of an order lifecycle event.
///
/// The serialized form is the snake_case tag (e.g. `"order_received"`), which is
/// also the message key used when publishing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Emitted by the order service when the request is received.
    OrderReceived,
    /// Emitted by the beans service after validating beans.
    OrderAccepted,
    /// Emitted by the beans service if it fails to validate beans.
    OrderRejected,
    /// Emitted by the brewery while brewing; repeated periodically as a heartbeat.
    OrderProcessing,
    /// Emitted by the brewery after completing the order.
    OrderProcessed,
    /// Emitted by the brewery if it fails to complete the order.
    OrderFailed,
    /// Emitted by the order service after delivering the order.
    OrderDelivered,
    /// Rejection reason: the requested coffee is not available.
    CoffeeNotAvailable,
}

impl Event {
    pub const ALL: [Event; 8] = [
        Event::OrderReceived,
        Event::OrderAccepted,
        Event::OrderRejected,
        Event::OrderProcessing,
        Event::OrderProcessed,
        Event::OrderFailed,
        Event::OrderDelivered,
        Event::CoffeeNotAvailable,
    ];

    /// The wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::OrderReceived => "order_received",
            Event::OrderAccepted => "order_accepted",
            Event::OrderRejected => "order_rejected",
            Event::OrderProcessing => "order_processing",
            Event::OrderProcessed => "order_processed",
            Event::OrderFailed => "order_failed",
            Event::OrderDelivered => "order_delivered",
            Event::CoffeeNotAvailable => "coffee_not_available",
        }
    }

    /// The order status an order holds after this event has been applied.
    ///
    /// `CoffeeNotAvailable` is a rejection reason, so it resolves to `OrderRejected`.
    pub fn resulting_status(&self) -> Event {
        match self {
            Event::CoffeeNotAvailable => Event::OrderRejected,
            other => *other,
        }
    }

    /// Whether an order in this status accepts no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.resulting_status(),
            Event::OrderRejected | Event::OrderFailed | Event::OrderDelivered
        )
    }

    /// Position along the happy path, used to tell regressions from skips.
    fn stage(&self) -> u8 {
        match self {
            Event::OrderReceived => 0,
            Event::OrderAccepted => 1,
            Event::OrderProcessing => 2,
            Event::OrderProcessed => 3,
            Event::OrderRejected
            | Event::CoffeeNotAvailable
            | Event::OrderFailed
            | Event::OrderDelivered => 4,
        }
    }

    /// Whether an event of this kind is a valid next step for an order in `status`.
    pub fn can_follow(&self, status: Event) -> bool {
        use Event::*;
        matches!(
            (status.resulting_status(), *self),
            (OrderReceived, OrderAccepted)
                | (OrderReceived, OrderRejected)
                | (OrderReceived, CoffeeNotAvailable)
                | (OrderAccepted, OrderProcessing)
                | (OrderAccepted, OrderFailed)
                | (OrderProcessing, OrderProcessing)
                | (OrderProcessing, OrderProcessed)
                | (OrderProcessing, OrderFailed)
                | (OrderProcessed, OrderDelivered)
        )
    }

    /// Whether applying this kind to `status` would move the order backwards.
    pub fn regresses(&self, status: Event) -> bool {
        self.stage() < status.stage()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown event tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEvent(pub String);

impl FromStr for Event {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Event::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

impl TryFrom<&[u8]> for Event {
    type Error = UnknownEvent;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| UnknownEvent(String::from_utf8_lossy(bytes).into_owned()))?;
        s.parse()
    }
}
