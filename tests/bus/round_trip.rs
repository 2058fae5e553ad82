use std::collections::BTreeMap;
use std::time::Duration;

use cafebucks::bus::{partition_for, ReadError, EVENT_HEADER};
use cafebucks::event::Event;

use crate::support::{broker, latte, reader_bus, TOPIC};

// ============================================================================
// Raw payloads
// ============================================================================

#[test]
fn payload_arrives_byte_identical() {
    let broker = broker(3);
    let bus = reader_bus(&broker);
    let payload = [0u8, 159, 146, 150, b'{', 0xff];

    let delivery = bus.publish(Event::OrderAccepted, &payload).unwrap();
    let message = bus.read_message(Duration::from_secs(1)).unwrap();

    assert_eq!(message.value, payload);
    assert_eq!(message.key, b"order_accepted");
    assert_eq!(message.kind().unwrap(), Event::OrderAccepted);
    assert_eq!(message.header(EVENT_HEADER), Some(&b"order_accepted"[..]));
    assert_eq!(message.partition, delivery.partition);
    assert_eq!(Some(message.offset), delivery.offset);
}

#[test]
fn same_kind_lands_on_one_partition_in_order() {
    let broker = broker(3);
    let bus = reader_bus(&broker);

    for i in 0..5u8 {
        bus.publish(Event::OrderProcessing, &[i]).unwrap();
    }

    let expected = partition_for(b"order_processing", 3);
    let values: Vec<Vec<u8>> = (0..5)
        .map(|_| {
            let message = bus.read_message(Duration::from_secs(1)).unwrap();
            assert_eq!(message.partition, expected);
            message.value
        })
        .collect();
    assert_eq!(values, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
}

#[test]
fn offsets_increase_within_each_partition() {
    let broker = broker(3);
    let bus = reader_bus(&broker);

    for kind in Event::ALL.iter().cycle().take(24) {
        bus.publish(*kind, kind.as_str().as_bytes()).unwrap();
    }

    let mut last: BTreeMap<i32, i64> = BTreeMap::new();
    for _ in 0..24 {
        let message = bus.read_message(Duration::from_secs(1)).unwrap();
        if let Some(previous) = last.insert(message.partition, message.offset) {
            assert!(message.offset > previous, "offsets went backwards");
        }
        assert_eq!(message.value, message.key);
    }
    assert!(matches!(
        bus.read_message(Duration::from_millis(30)),
        Err(ReadError::Timeout)
    ));
}

// ============================================================================
// Envelopes
// ============================================================================

#[test]
fn envelope_round_trips_through_the_topic() {
    let broker = broker(3);
    let bus = reader_bus(&broker);

    let sent = bus.publish_order(Event::OrderReceived, &latte(42)).unwrap();
    let received = bus.read_next(Duration::from_secs(1)).unwrap();

    assert_eq!(received, sent);
    assert_eq!(broker.len(TOPIC), 1);
}

#[test]
fn event_ids_are_unique_per_bus() {
    let broker = broker(1);
    let bus = reader_bus(&broker);

    let first = bus.publish_order(Event::OrderReceived, &latte(1)).unwrap();
    let second = bus.publish_order(Event::OrderReceived, &latte(2)).unwrap();
    assert_ne!(first.event_id, second.event_id);
}

#[test]
fn garbage_payload_is_malformed_not_fatal() {
    let broker = broker(1);
    let bus = reader_bus(&broker);

    bus.publish(Event::OrderReceived, b"not json").unwrap();
    bus.publish_order(Event::OrderReceived, &latte(5)).unwrap();

    let err = bus.read_next(Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, ReadError::Malformed { .. }));
    let next = bus.read_next(Duration::from_secs(1)).unwrap();
    assert_eq!(next.order.order_id, 5);
}

// ============================================================================
// Seeking
// ============================================================================

#[test]
fn set_offset_replays_a_partition() {
    let broker = broker(1);
    let bus = reader_bus(&broker);

    for i in 0..3u8 {
        bus.publish(Event::OrderProcessing, &[i]).unwrap();
    }
    for _ in 0..3 {
        bus.read_message(Duration::from_secs(1)).unwrap();
    }

    bus.set_offset(0, 1).unwrap();
    let message = bus.read_message(Duration::from_secs(1)).unwrap();
    assert_eq!(message.offset, 1);
    assert_eq!(message.value, vec![1]);
}

#[test]
fn seeking_past_the_end_waits_for_new_records() {
    let broker = broker(1);
    let bus = reader_bus(&broker);
    bus.publish(Event::OrderProcessing, b"old").unwrap();

    bus.set_offset(0, 10).unwrap();
    assert!(matches!(
        bus.read_message(Duration::from_millis(30)),
        Err(ReadError::Timeout)
    ));
}
