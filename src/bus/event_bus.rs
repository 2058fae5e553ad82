//! EventBus - one handle over a topic's publisher, reader, and group membership.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::cancel::CancellationToken;
use super::connector::{BusConfig, Connector};
use super::error::{ConnectError, GroupError, PublishError, ReadError, ShutdownError};
use super::generation::GenerationManager;
use super::managed::{self, LoopWatch, ManagedLoopHandle};
use super::message::{Delivery, Message, Offset, Partition, Record, EVENT_HEADER};
use super::publisher::Publisher;
use super::reader::Reader;
use super::retry::RetryPolicy;
use crate::event::{Event, EventEnvelope, EventIds, Order};

/// How often `close` checks whether loops have exited.
const CLOSE_POLL: Duration = Duration::from_millis(5);

/// Publisher, reader, and consumer-group membership for one topic.
///
/// A bus configured with a `group_id` reads through `run_managed_loop`; one
/// without reads every partition through `read_next`. All connections are owned
/// here and released by `close` or on drop.
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use cafebucks::bus::{BusConfig, EventBus, InMemoryBroker};
/// use cafebucks::event::{Coffee, Event, Order};
///
/// let broker = InMemoryBroker::new().with_topic("orders", 1);
/// let config = BusConfig::new(vec!["localhost:9092".into()], "orders");
/// let bus = EventBus::connect(config, &broker).unwrap();
///
/// let order = Order::new(42, Coffee::new("latte", 3.5));
/// bus.publish_order(Event::OrderReceived, &order).unwrap();
///
/// let envelope = bus.read_next(Duration::from_secs(1)).unwrap();
/// assert_eq!(envelope.order, order);
/// bus.close().unwrap();
/// ```
pub struct EventBus<C: Connector> {
    config: BusConfig,
    publisher: RwLock<Option<C::Publisher>>,
    reader: RwLock<Option<C::Reader>>,
    generations: Option<Arc<GenerationManager<C::Coordinator>>>,
    loops: Mutex<Vec<LoopWatch>>,
    ids: EventIds,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<C: Connector> EventBus<C> {
    /// Validate `config` and open the clients it calls for.
    pub fn connect(config: BusConfig, connector: &C) -> Result<Self, ConnectError> {
        config.validate()?;

        let publisher = connector.publisher(&config)?;
        let (reader, generations) = if config.is_managed() {
            let coordinator = connector.coordinator(&config)?;
            let manager = GenerationManager::new(coordinator, config.poll_interval);
            (None, Some(Arc::new(manager)))
        } else {
            (Some(connector.reader(&config)?), None)
        };

        info!(
            brokers = ?config.brokers,
            topic = %config.topic,
            group = %config.group_id,
            client = %config.client_id,
            "event bus connected"
        );

        Ok(Self {
            config,
            publisher: RwLock::new(Some(publisher)),
            reader: RwLock::new(reader),
            generations,
            loops: Mutex::new(Vec::new()),
            ids: EventIds::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Publish `payload` keyed by `kind`.
    ///
    /// Returns once the broker has the record. Never retried here; see
    /// `publish_with_retry`.
    pub fn publish(&self, kind: Event, payload: &[u8]) -> Result<Delivery, PublishError> {
        let guard = self.publisher.read().unwrap_or_else(|e| e.into_inner());
        let publisher = guard.as_ref().ok_or(PublishError::Closed)?;

        let key = kind.as_str().as_bytes();
        let headers = [(EVENT_HEADER, key)];
        let record = Record {
            topic: &self.config.topic,
            key,
            value: payload,
            headers: &headers,
        };

        match publisher.publish(record) {
            Ok(delivery) => {
                debug!(
                    topic = %self.config.topic,
                    %kind,
                    partition = delivery.partition,
                    offset = ?delivery.offset,
                    "published"
                );
                Ok(delivery)
            }
            Err(e) => {
                warn!(topic = %self.config.topic, %kind, error = %e, "publish failed");
                Err(e)
            }
        }
    }

    /// Wrap `order` in an envelope with a fresh event id and publish it as JSON.
    pub fn publish_order(&self, kind: Event, order: &Order) -> Result<EventEnvelope, PublishError> {
        let envelope = EventEnvelope::new(self.ids.next_id(), kind, order.clone())?;
        let payload = envelope.to_json()?;
        self.publish(kind, &payload)?;
        Ok(envelope)
    }

    /// `publish` with caller-chosen retries on connection loss.
    ///
    /// A retried publish may be stored twice; consumers must tolerate duplicates.
    pub fn publish_with_retry(
        &self,
        kind: Event,
        payload: &[u8],
        policy: &RetryPolicy,
    ) -> Result<Delivery, PublishError> {
        let mut attempt = 0u32;
        loop {
            match self.publish(kind, payload) {
                Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    attempt += 1;
                    info!(%kind, attempt, retry_in = ?delay, "retrying publish");
                    if self.cancel.sleep(delay) {
                        return Err(PublishError::Closed);
                    }
                }
                result => return result,
            }
        }
    }

    /// Next raw record from any partition, waiting up to `timeout`.
    ///
    /// Waits in poll-interval slices so `close` interrupts it promptly.
    pub fn read_message(&self, timeout: Duration) -> Result<Message, ReadError> {
        if self.config.is_managed() {
            return Err(ReadError::ManagedMode(self.config.group_id.clone()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ReadError::Closed);
            }
            let guard = self.reader.read().unwrap_or_else(|e| e.into_inner());
            let reader = guard.as_ref().ok_or(ReadError::Closed)?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            match reader.read(remaining.min(self.config.poll_interval)) {
                Err(ReadError::Timeout) if Instant::now() < deadline => continue,
                result => return result,
            }
        }
    }

    /// Next envelope from any partition, waiting up to `timeout`.
    pub fn read_next(&self, timeout: Duration) -> Result<EventEnvelope, ReadError> {
        self.read_message(timeout)?.envelope()
    }

    /// Move the unmanaged reader's position in `partition`.
    ///
    /// A managed bus seeks the group instead, through `generations()`.
    pub fn set_offset(&self, partition: Partition, offset: Offset) -> Result<(), ReadError> {
        if self.config.is_managed() {
            return Err(ReadError::ManagedMode(self.config.group_id.clone()));
        }
        let guard = self.reader.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .ok_or(ReadError::Closed)?
            .seek(partition, offset)?;
        info!(topic = %self.config.topic, partition, offset, "reader offset set");
        Ok(())
    }

    /// Group membership, when a `group_id` is configured.
    pub fn generations(&self) -> Option<&GenerationManager<C::Coordinator>> {
        self.generations.as_deref()
    }

    /// Start the generation-scoped read loop on its own thread.
    ///
    /// Only one loop may run per bus. Handler errors and undecodable records are
    /// logged and skipped; their offsets still advance.
    pub fn run_managed_loop<F, E>(&self, handler: F) -> Result<ManagedLoopHandle, GroupError>
    where
        F: FnMut(&EventEnvelope) -> Result<(), E> + Send + 'static,
        E: Display,
    {
        let manager = self.generations.as_ref().ok_or_else(|| {
            GroupError::Rejected("bus has no consumer group configured".into())
        })?;

        // `close` marks the bus closed before it collects loops, so checking under
        // the lock means every spawned loop is seen by `close`.
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return Err(GroupError::Closed);
        }
        if loops.iter().any(|watch| !watch.is_done()) {
            return Err(GroupError::Rejected(format!(
                "managed loop already running for {}",
                self.config.topic
            )));
        }

        let (handle, watch) = managed::spawn(
            Arc::clone(manager),
            self.config.topic.clone(),
            self.config.poll_interval,
            handler,
        );
        info!(group = %self.config.group_id, topic = %self.config.topic, "managed loop started");
        loops.retain(|w| !w.is_done());
        loops.push(watch);
        Ok(handle)
    }

    /// `close_within` the configured shutdown timeout.
    pub fn close(&self) -> Result<(), ShutdownError> {
        self.close_within(self.config.shutdown_timeout)
    }

    /// Cancel reads, stop managed loops, leave the consumer group, and release
    /// connections.
    ///
    /// Waits up to `deadline` for loops to exit. Connections are released even
    /// when some loops are still stuck. Closing twice is a no-op.
    pub fn close_within(&self, deadline: Duration) -> Result<(), ShutdownError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(topic = %self.config.topic, ?deadline, "closing event bus");
        self.cancel.cancel();

        let watches = self
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for watch in &watches {
            watch.cancel.cancel();
        }

        let until = Instant::now() + deadline;
        while watches.iter().any(|w| !w.is_done()) && Instant::now() < until {
            thread::sleep(CLOSE_POLL);
        }
        let stuck: Vec<String> = watches
            .iter()
            .filter(|w| !w.is_done())
            .map(|w| w.name.clone())
            .collect();

        if let Some(manager) = &self.generations {
            if let Err(e) = manager.close() {
                warn!(group = %self.config.group_id, error = %e, "failed to leave consumer group");
            }
        }

        if let Some(reader) = self.reader.write().unwrap_or_else(|e| e.into_inner()).take() {
            reader.close();
        }
        if let Some(publisher) = self
            .publisher
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            publisher.close();
        }

        if stuck.is_empty() {
            info!(topic = %self.config.topic, "event bus closed");
            Ok(())
        } else {
            error!(
                topic = %self.config.topic,
                group = %self.config.group_id,
                brokers = ?self.config.brokers,
                ?stuck,
                "managed loops did not stop before the deadline"
            );
            Err(ShutdownError::DeadlineExceeded { deadline, stuck })
        }
    }
}

impl<C: Connector> Drop for EventBus<C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "event bus dropped without a clean close");
        }
    }
}
