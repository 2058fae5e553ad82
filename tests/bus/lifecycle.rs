use std::time::Duration;

use cafebucks::bus::{PublishError, ReadError};
use cafebucks::event::{Anomaly, Coffee, Event, Observation, Order, OrderTracker};

use crate::support::{broker, latte, reader_bus};

const WAIT: Duration = Duration::from_secs(1);

#[test]
fn order_42_latte_is_received_with_its_item() {
    let broker = broker(3);
    let producer = reader_bus(&broker);
    let consumer = reader_bus(&broker);

    producer
        .publish_order(Event::OrderReceived, &latte(42))
        .unwrap();

    let envelope = consumer.read_next(WAIT).unwrap();
    assert_eq!(envelope.kind, Event::OrderReceived);
    assert_eq!(envelope.order.order_id, 42);
    assert_eq!(envelope.order.item, Coffee::new("latte", 3.5));
    assert_eq!(envelope.order.status, Event::OrderReceived);
}

#[test]
fn happy_path_reaches_delivered() {
    // One partition keeps the whole lifecycle in publish order.
    let broker = broker(1);
    let bus = reader_bus(&broker);
    let mut order = latte(42);
    bus.publish_order(Event::OrderReceived, &order).unwrap();

    let steps = [
        Event::OrderAccepted,
        Event::OrderProcessing,
        Event::OrderProcessing,
        Event::OrderProcessed,
        Event::OrderDelivered,
    ];
    for kind in steps {
        order.transition(kind).unwrap();
        bus.publish_order(kind, &order).unwrap();
    }

    let mut tracker = OrderTracker::new();
    for _ in 0..=steps.len() {
        tracker.observe(&bus.read_next(WAIT).unwrap());
    }

    assert_eq!(tracker.status(42), Some(Event::OrderDelivered));
    assert_eq!(tracker.anomalies(), 0);
    assert!(tracker.order(42).unwrap().is_terminal());
}

#[test]
fn order_7_rejected_for_missing_coffee_is_terminal() {
    let broker = broker(1);
    let bus = reader_bus(&broker);

    let mut order = Order::new(7, Coffee::new("flat white", 4.0));
    bus.publish_order(Event::OrderReceived, &order).unwrap();
    order.transition(Event::CoffeeNotAvailable).unwrap();
    let rejected = bus
        .publish_order(Event::CoffeeNotAvailable, &order)
        .unwrap();
    assert_eq!(rejected.order.status, Event::OrderRejected);

    // A stale producer still announces acceptance.
    let mut stale = Order::new(7, Coffee::new("flat white", 4.0));
    stale.transition(Event::OrderAccepted).unwrap();
    bus.publish_order(Event::OrderAccepted, &stale).unwrap();

    let mut tracker = OrderTracker::new();
    assert_eq!(tracker.observe(&bus.read_next(WAIT).unwrap()), Observation::Created);
    assert_eq!(
        tracker.observe(&bus.read_next(WAIT).unwrap()),
        Observation::Advanced {
            from: Event::OrderReceived,
            to: Event::OrderRejected,
        }
    );
    assert_eq!(
        tracker.observe(&bus.read_next(WAIT).unwrap()),
        Observation::Skipped(Anomaly::AfterTerminal)
    );
    assert_eq!(tracker.status(7), Some(Event::OrderRejected));
}

#[test]
fn publishing_an_unapplied_transition_is_refused() {
    let broker = broker(1);
    let bus = reader_bus(&broker);

    // Status is still order_received.
    let err = bus
        .publish_order(Event::OrderAccepted, &latte(9))
        .unwrap_err();
    assert!(matches!(err, PublishError::InvalidEvent(_)));
    assert!(broker.is_empty("orders"));
}

#[test]
fn reordered_partitions_never_move_an_order_backwards() {
    // Kinds hash to different partitions, so the reader may see them out of order.
    let broker = broker(3);
    let bus = reader_bus(&broker);
    let mut order = latte(11);
    bus.publish_order(Event::OrderReceived, &order).unwrap();
    for kind in [Event::OrderAccepted, Event::OrderProcessing, Event::OrderProcessed] {
        order.transition(kind).unwrap();
        bus.publish_order(kind, &order).unwrap();
    }

    let mut tracker = OrderTracker::new();
    let mut seen = Vec::new();
    for _ in 0..4 {
        tracker.observe(&bus.read_next(WAIT).unwrap());
        if let Some(status) = tracker.status(11) {
            seen.push(status);
        }
    }

    let stages: Vec<usize> = seen
        .iter()
        .map(|s| {
            [
                Event::OrderReceived,
                Event::OrderAccepted,
                Event::OrderProcessing,
                Event::OrderProcessed,
            ]
            .iter()
            .position(|k| k == s)
            .unwrap()
        })
        .collect();
    assert!(stages.windows(2).all(|w| w[0] <= w[1]), "status regressed: {seen:?}");
}

#[test]
fn envelope_with_a_status_its_kind_never_produces_is_malformed() {
    let broker = broker(1);
    let bus = reader_bus(&broker);
    let forged = r#"{"event_id":1,"kind":"order_received","order":{"order_id":9,"item":{"name":"latte","price":3.5},"status":"coffee_not_available"}}"#;
    bus.publish(Event::OrderReceived, forged.as_bytes()).unwrap();
    bus.publish_order(Event::OrderReceived, &latte(10)).unwrap();

    let mut tracker = OrderTracker::new();
    let err = bus.read_next(WAIT).unwrap_err();
    assert!(matches!(err, ReadError::Malformed { .. }));
    tracker.observe(&bus.read_next(WAIT).unwrap());

    assert_eq!(tracker.status(9), None);
    assert_eq!(tracker.status(10), Some(Event::OrderReceived));
}
