use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cafebucks::bus::{CancellationToken, GenerationId, GroupError, ReadError};
use cafebucks::event::{Event, EventEnvelope};

use crate::support::{broker, group_bus, latte, reader_bus, wait_until, GROUP, TOPIC};

const WAIT: Duration = Duration::from_secs(5);

fn collector() -> (
    Arc<Mutex<Vec<i64>>>,
    impl FnMut(&EventEnvelope) -> Result<(), String> + Send + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = move |envelope: &EventEnvelope| {
        sink.lock().unwrap().push(envelope.order.order_id);
        Ok(())
    };
    (seen, handler)
}

// ============================================================================
// Managed loop
// ============================================================================

#[test]
fn rebalance_mid_read_commits_only_with_current_generations() {
    let broker = broker(3);
    let bus = group_bus(&broker);
    let (seen, handler) = collector();
    let handle = bus.run_managed_loop(handler).unwrap();

    assert!(wait_until(WAIT, || broker.generation(GROUP).is_some()));
    for id in 0..5 {
        bus.publish_order(Event::OrderReceived, &latte(id)).unwrap();
    }
    assert!(wait_until(WAIT, || seen.lock().unwrap().len() >= 5));

    broker.force_rebalance(GROUP);
    for id in 5..10 {
        bus.publish_order(Event::OrderReceived, &latte(id)).unwrap();
    }
    assert!(wait_until(WAIT, || {
        let ids: BTreeSet<i64> = seen.lock().unwrap().iter().copied().collect();
        ids.len() == 10
    }));
    assert!(wait_until(WAIT, || broker.generation(GROUP) == Some(GenerationId(2))));

    let stats = handle.stop();
    assert!(stats.generations >= 2);
    assert!(stats.handled >= 10);

    let log = broker.commit_log(GROUP);
    assert!(!log.is_empty());
    assert!(log.windows(2).all(|w| w[0].generation <= w[1].generation));
    assert!(log.iter().all(|c| c.generation <= GenerationId(2)));
    assert!(log.iter().any(|c| c.generation == GenerationId(2)));

    let partition = cafebucks::bus::partition_for(b"order_received", 3);
    assert_eq!(broker.committed(GROUP, TOPIC, partition), Some(10));
    assert!(broker.members(GROUP).is_empty());
}

#[test]
fn broker_outage_mid_read_resumes_in_the_same_generation() {
    let broker = broker(1);
    let bus = group_bus(&broker);
    let (seen, handler) = collector();
    let handle = bus.run_managed_loop(handler).unwrap();

    assert!(wait_until(WAIT, || broker.generation(GROUP).is_some()));
    for id in 0..3 {
        bus.publish_order(Event::OrderReceived, &latte(id)).unwrap();
    }
    assert!(wait_until(WAIT, || broker.committed(GROUP, TOPIC, 0) == Some(3)));

    broker.set_available(false);
    thread::sleep(Duration::from_millis(100));
    broker.set_available(true);

    for id in 3..6 {
        bus.publish_order(Event::OrderReceived, &latte(id)).unwrap();
    }
    assert!(wait_until(WAIT, || broker.committed(GROUP, TOPIC, 0) == Some(6)));

    let stats = handle.stop();
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(stats.generations, 1);
    assert_eq!(stats.handled, 6);
    assert!(broker
        .commit_log(GROUP)
        .iter()
        .all(|c| c.generation == GenerationId(1)));
}

#[test]
fn a_second_loop_on_the_same_bus_is_rejected() {
    let broker = broker(1);
    let bus = group_bus(&broker);
    let (_, first) = collector();
    let (_, second) = collector();

    let handle = bus.run_managed_loop(first).unwrap();
    let err = bus.run_managed_loop(second).unwrap_err();
    assert!(matches!(err, GroupError::Rejected(_)));

    handle.stop();
    let (_, third) = collector();
    bus.run_managed_loop(third).unwrap().stop();
}

#[test]
fn managed_loop_needs_a_group() {
    let broker = broker(1);
    let bus = reader_bus(&broker);
    let (_, handler) = collector();
    assert!(matches!(
        bus.run_managed_loop(handler),
        Err(GroupError::Rejected(_))
    ));
}

#[test]
fn managed_bus_refuses_direct_reads() {
    let broker = broker(1);
    let bus = group_bus(&broker);
    assert!(matches!(
        bus.read_next(Duration::from_millis(10)),
        Err(ReadError::ManagedMode(_))
    ));
    assert!(matches!(bus.set_offset(0, 0), Err(ReadError::ManagedMode(_))));
}

#[test]
fn two_members_share_the_topic_without_losing_records() {
    let broker = broker(4);
    let first = group_bus(&broker);
    let second = group_bus(&broker);

    let seen = Arc::new(Mutex::new(BTreeSet::new()));
    let handles: Vec<_> = [&first, &second]
        .into_iter()
        .map(|bus| {
            let sink = Arc::clone(&seen);
            bus.run_managed_loop(move |envelope: &EventEnvelope| {
                sink.lock().unwrap().insert(envelope.event_id);
                Ok::<_, String>(())
            })
            .unwrap()
        })
        .collect();

    assert!(wait_until(WAIT, || broker.members(GROUP).len() == 2));

    let mut published = BTreeSet::new();
    for (i, kind) in Event::ALL.iter().cycle().take(40).enumerate() {
        let mut order = latte(i as i64);
        order.status = kind.resulting_status();
        let envelope = EventEnvelope::new(1_000 + i as i64, *kind, order).unwrap();
        first.publish(*kind, &envelope.to_json().unwrap()).unwrap();
        published.insert(envelope.event_id);
    }

    assert!(wait_until(WAIT, || *seen.lock().unwrap() == published));
    for handle in handles {
        handle.stop();
    }
}

// ============================================================================
// Manual generation handling
// ============================================================================

#[test]
fn stale_generation_cannot_commit() {
    let broker = broker(1);
    let bus = group_bus(&broker);
    let manager = bus.generations().unwrap();
    let token = CancellationToken::new();

    let first = manager.join_or_advance_generation(&token).unwrap();
    broker.force_rebalance(GROUP);
    let second = manager.join_or_advance_generation(&token).unwrap();
    assert!(second.epoch > first.epoch);

    let err = manager.commit_offset(&first, TOPIC, 0, 1).unwrap_err();
    assert!(matches!(
        err,
        GroupError::StaleGeneration { held, current: Some(current) }
            if held == first.epoch && current == second.epoch
    ));
    assert!(err.requires_rejoin());
    assert!(broker.commit_log(GROUP).is_empty());

    manager.commit_offset(&second, TOPIC, 0, 1).unwrap();
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(1));
}

#[test]
fn commits_never_move_backwards() {
    let broker = broker(1);
    let bus = group_bus(&broker);
    let manager = bus.generations().unwrap();
    let generation = manager
        .join_or_advance_generation(&CancellationToken::new())
        .unwrap();
    let (partition, start) = manager.current_assignment(&generation, TOPIC)[0];
    assert_eq!(start, 0);

    manager.commit_offset(&generation, TOPIC, partition, 5).unwrap();
    let err = manager
        .commit_offset(&generation, TOPIC, partition, 3)
        .unwrap_err();
    assert!(matches!(
        err,
        GroupError::OffsetRegression { committed: 5, requested: 3, .. }
    ));
    manager.commit_offset(&generation, TOPIC, partition, 5).unwrap();
    assert_eq!(broker.committed(GROUP, TOPIC, partition), Some(5));
}

#[test]
fn commits_are_limited_to_owned_partitions() {
    let broker = broker(2);
    let busy = group_bus(&broker);
    let (_, handler) = collector();
    let handle = busy.run_managed_loop(handler).unwrap();
    assert!(wait_until(WAIT, || broker.generation(GROUP).is_some()));

    let bus = group_bus(&broker);
    let manager = bus.generations().unwrap();
    let generation = manager
        .join_or_advance_generation(&CancellationToken::new())
        .unwrap();
    let owned = generation.owned(TOPIC);
    assert_eq!(owned.len(), 1);

    let other = 1 - owned[0].0;
    let err = manager.commit_offset(&generation, TOPIC, other, 1).unwrap_err();
    assert!(matches!(err, GroupError::NotAssigned { partition, .. } if partition == other));

    handle.stop();
}

#[test]
fn join_waits_for_every_member_and_can_be_cancelled() {
    let broker = broker(2);
    let holder = group_bus(&broker);
    holder
        .generations()
        .unwrap()
        .join_or_advance_generation(&CancellationToken::new())
        .unwrap();

    let newcomer = Arc::new(group_bus(&broker));
    let token = CancellationToken::new();
    let joining = {
        let newcomer = Arc::clone(&newcomer);
        let token = token.clone();
        thread::spawn(move || {
            newcomer
                .generations()
                .unwrap()
                .join_or_advance_generation(&token)
        })
    };

    // The holder never rejoins, so the rebalance cannot complete.
    thread::sleep(Duration::from_millis(50));
    assert!(broker.is_rebalancing(GROUP));
    token.cancel();
    let result = joining.join().unwrap();
    assert!(matches!(result, Err(GroupError::Cancelled)));
}

// ============================================================================
// Group offsets
// ============================================================================

#[test]
fn get_offset_without_commits_is_an_error() {
    let broker = broker(1);
    let bus = group_bus(&broker);
    let err = bus.generations().unwrap().get_offset(TOPIC, GROUP).unwrap_err();
    assert!(matches!(err, GroupError::NoCommittedOffset { .. }));
}

#[test]
fn set_offset_replays_from_the_chosen_record() {
    let broker = broker(1);
    let bus = group_bus(&broker);
    for id in 0..3 {
        bus.publish_order(Event::OrderReceived, &latte(id)).unwrap();
    }

    let manager = bus.generations().unwrap();
    manager.set_offset(TOPIC, 0, 2).unwrap();
    assert_eq!(manager.get_offset(TOPIC, GROUP).unwrap(), 2);

    let (seen, handler) = collector();
    let handle = bus.run_managed_loop(handler).unwrap();
    assert!(wait_until(WAIT, || !seen.lock().unwrap().is_empty()));
    thread::sleep(Duration::from_millis(50));
    handle.stop();

    assert_eq!(*seen.lock().unwrap(), vec![2]);
    assert_eq!(manager.get_offset(TOPIC, GROUP).unwrap(), 3);
}

#[test]
fn set_offset_is_refused_while_members_are_active() {
    let broker = broker(1);
    let bus = group_bus(&broker);
    let (_, handler) = collector();
    let handle = bus.run_managed_loop(handler).unwrap();
    assert!(wait_until(WAIT, || !broker.members(GROUP).is_empty()));

    let err = bus.generations().unwrap().set_offset(TOPIC, 0, 0).unwrap_err();
    assert!(matches!(err, GroupError::Rejected(_)));
    handle.stop();
}
