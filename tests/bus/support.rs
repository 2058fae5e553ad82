use std::thread;
use std::time::{Duration, Instant};

use cafebucks::bus::{BusConfig, EventBus, InMemoryBroker};
use cafebucks::event::{Coffee, Order};

pub const TOPIC: &str = "orders";
pub const GROUP: &str = "baristas";

pub fn broker(partitions: usize) -> InMemoryBroker {
    InMemoryBroker::new().with_topic(TOPIC, partitions)
}

pub fn config() -> BusConfig {
    BusConfig::new(vec!["localhost:9092".into()], TOPIC)
        .with_poll_interval(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_secs(5))
}

/// Bus reading every partition directly.
pub fn reader_bus(broker: &InMemoryBroker) -> EventBus<InMemoryBroker> {
    EventBus::connect(config(), broker).unwrap()
}

/// Bus reading through the `baristas` group.
pub fn group_bus(broker: &InMemoryBroker) -> EventBus<InMemoryBroker> {
    EventBus::connect(config().with_group(GROUP), broker).unwrap()
}

pub fn latte(order_id: i64) -> Order {
    Order::new(order_id, Coffee::new("latte", 3.5))
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + timeout;
    while Instant::now() < until {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}
