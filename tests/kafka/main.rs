//! Integration tests against a running Kafka broker.
//!
//! Ignored by default. Run with a broker and an existing topic:
//!
//! ```text
//! KAFKA_BOOTSTRAP_SERVERS=localhost:9092 KAFKA_TEST_TOPIC=cafebucks-test \
//!     cargo test --features kafka --test kafka -- --ignored
//! ```
#![cfg(feature = "kafka")]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cafebucks::bus::{BusConfig, CancellationToken, EventBus, GroupError, KafkaConnector, ReadError};
use cafebucks::event::{Coffee, Event, EventEnvelope, Order};

const WAIT: Duration = Duration::from_secs(30);

/// Broker config for this run, or `None` when no broker is configured.
fn config() -> Option<BusConfig> {
    let brokers = std::env::var("KAFKA_BOOTSTRAP_SERVERS").ok()?;
    let topic = std::env::var("KAFKA_TEST_TOPIC").unwrap_or_else(|_| "cafebucks-test".into());
    Some(
        BusConfig::new(brokers.split(',').map(str::to_string).collect(), topic)
            .with_client_id(format!("cafebucks-test-{}", run_id()))
            .with_poll_interval(Duration::from_millis(100))
            .with_shutdown_timeout(Duration::from_secs(10)),
    )
}

/// Distinct per run so order ids and group ids never collide with earlier runs.
fn run_id() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn latte(order_id: i64) -> Order {
    Order::new(order_id, Coffee::new("latte", 3.5))
}

/// Read until `order_id` shows up, skipping records left by earlier runs.
fn read_until(bus: &EventBus<KafkaConnector>, order_id: i64) -> EventEnvelope {
    let until = Instant::now() + WAIT;
    loop {
        assert!(Instant::now() < until, "order {order_id} never arrived");
        match bus.read_next(Duration::from_secs(1)) {
            Ok(envelope) if envelope.order.order_id == order_id => return envelope,
            Ok(_) | Err(ReadError::Timeout) | Err(ReadError::Malformed { .. }) => continue,
            Err(e) => panic!("read failed: {e}"),
        }
    }
}

// ============================================================================
// Publish and read
// ============================================================================

#[test]
#[ignore] // Requires a Kafka broker
fn published_order_is_read_back() {
    let Some(config) = config() else { return };
    let bus = EventBus::connect(config, &KafkaConnector::new()).unwrap();

    let order_id = run_id();
    let sent = bus.publish_order(Event::OrderReceived, &latte(order_id)).unwrap();
    let received = read_until(&bus, order_id);

    assert_eq!(received, sent);
    bus.close().unwrap();
}

// ============================================================================
// Consumer group
// ============================================================================

#[test]
#[ignore] // Requires a Kafka broker
fn group_commits_are_visible_to_offset_queries() {
    let Some(config) = config() else { return };
    let group = format!("cafebucks-test-group-{}", run_id());
    let topic = config.topic.clone();
    let bus = EventBus::connect(config.with_group(group.clone()), &KafkaConnector::new()).unwrap();
    let manager = bus.generations().unwrap();

    let generation = manager.join_or_advance_generation(&CancellationToken::new()).unwrap();
    let owned = generation.owned(&topic);
    assert!(!owned.is_empty());
    for (partition, _) in &owned {
        manager.commit_offset(&generation, &topic, *partition, 0).unwrap();
    }

    let committed = manager.get_offsets(&topic, &group).unwrap();
    for (partition, _) in &owned {
        assert_eq!(committed.get(partition), Some(&0));
    }

    bus.close().unwrap();
    assert!(matches!(
        manager.join_or_advance_generation(&CancellationToken::new()),
        Err(GroupError::Closed)
    ));
}

#[test]
#[ignore] // Requires a Kafka broker
fn managed_loop_handles_and_commits_new_orders() {
    let Some(config) = config() else { return };
    let group = format!("cafebucks-test-loop-{}", run_id());
    let topic = config.topic.clone();
    let bus = EventBus::connect(config.with_group(group.clone()), &KafkaConnector::new()).unwrap();

    let first = run_id() * 10;
    let wanted: BTreeSet<i64> = (first..first + 3).collect();
    let seen = Arc::new(Mutex::new(BTreeSet::new()));
    let sink = Arc::clone(&seen);
    let handle = bus
        .run_managed_loop(move |envelope: &EventEnvelope| {
            sink.lock().unwrap().insert(envelope.order.order_id);
            Ok::<(), String>(())
        })
        .unwrap();

    for id in &wanted {
        bus.publish_order(Event::OrderReceived, &latte(*id)).unwrap();
    }

    let until = Instant::now() + WAIT;
    while !wanted.is_subset(&seen.lock().unwrap()) {
        assert!(Instant::now() < until, "managed loop missed orders");
        thread::sleep(Duration::from_millis(50));
    }

    let stats = handle.stop();
    assert!(stats.handled >= wanted.len());
    assert!(stats.generations >= 1);

    let committed = bus.generations().unwrap().get_offsets(&topic, &group).unwrap();
    assert!(!committed.is_empty());
    bus.close().unwrap();
}
