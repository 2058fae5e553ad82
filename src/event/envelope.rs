//! The unit placed on the bus.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::kind::Event;
use super::order::{Order, TransitionError};

/// An event about an order, as published to and read from the bus.
///
/// Built immediately before publishing and never mutated afterwards. Decoding
/// applies the same status check as `new`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct EventEnvelope {
    pub event_id: i64,
    pub kind: Event,
    pub order: Order,
}

/// Wire shape of an envelope before its status is checked.
#[derive(Deserialize)]
struct RawEnvelope {
    event_id: i64,
    kind: Event,
    order: Order,
}

impl TryFrom<RawEnvelope> for EventEnvelope {
    type Error = TransitionError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        EventEnvelope::new(raw.event_id, raw.kind, raw.order)
    }
}

impl EventEnvelope {
    /// Wrap `order` for publishing as `kind`.
    ///
    /// The order must already carry the status `kind` leads to, i.e. the producer
    /// has applied the transition before announcing it.
    pub fn new(event_id: i64, kind: Event, order: Order) -> Result<Self, TransitionError> {
        if order.status != kind.resulting_status() {
            return Err(TransitionError {
                order_id: order.order_id,
                status: order.status,
                kind,
            });
        }
        Ok(Self {
            event_id,
            kind,
            order,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Hands out event ids: wall-clock milliseconds in the high bits, a sequence below.
#[derive(Debug)]
pub struct EventIds {
    next: AtomicI64,
}

impl EventIds {
    pub fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self::starting_at(millis << 16)
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for EventIds {
    fn default() -> Self {
        Self::new()
    }
}
