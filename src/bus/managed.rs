//! Generation-scoped read loop on a background thread.
//!
//! The loop joins the group, reads from the partitions it owns, and hands each
//! decoded envelope to the handler. Progress is committed every
//! `COMMIT_EVERY` records, whenever the topic goes idle, when the generation
//! ends, and on stop. A commit always carries the generation the records were
//! read under, so a rebalance never lets a stale token through.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::cancel::CancellationToken;
use super::error::{GroupError, ReadError};
use super::generation::{Generation, GenerationManager};
use super::group::GroupCoordinator;
use super::message::{Offset, Partition};
use super::retry::reconnect_backoff;
use crate::event::EventEnvelope;

/// Records handled between periodic commits.
pub const COMMIT_EVERY: usize = 100;

/// Statistics from a managed loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopStats {
    /// Envelopes the handler accepted.
    pub handled: usize,
    /// Records that failed to decode or that the handler rejected.
    pub failed: usize,
    /// Generations joined.
    pub generations: usize,
    /// Partition offsets committed.
    pub commits: usize,
}

/// A running managed loop.
///
/// Dropping the handle signals the loop to stop without waiting for it.
#[derive(Debug)]
pub struct ManagedLoopHandle {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<LoopStats>>,
}

impl ManagedLoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the loop to stop and wait for it to finish.
    /// Returns the loop statistics.
    pub fn stop(mut self) -> LoopStats {
        self.cancel.cancel();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => LoopStats::default(),
        }
    }

    /// Signal the loop to stop without waiting.
    pub fn signal_stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ManagedLoopHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What the bus keeps about a loop so `close` can stop and wait for it.
#[derive(Clone)]
pub(crate) struct LoopWatch {
    pub name: String,
    pub cancel: CancellationToken,
    pub done: Arc<AtomicBool>,
}

impl LoopWatch {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// Marks the loop done however the thread exits.
struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn spawn<C, F, E>(
    manager: Arc<GenerationManager<C>>,
    topic: String,
    poll_interval: Duration,
    handler: F,
) -> (ManagedLoopHandle, LoopWatch)
where
    C: GroupCoordinator + 'static,
    F: FnMut(&EventEnvelope) -> Result<(), E> + Send + 'static,
    E: Display,
{
    let name = format!("{}/{}", manager.group_id(), topic);
    let cancel = CancellationToken::new();
    let done = Arc::new(AtomicBool::new(false));

    let watch = LoopWatch {
        name: name.clone(),
        cancel: cancel.clone(),
        done: Arc::clone(&done),
    };

    let token = cancel.clone();
    let handle = thread::spawn(move || {
        let _done = DoneGuard(done);
        ManagedLoop {
            manager,
            topic,
            poll_interval,
            cancel: token,
            stats: LoopStats::default(),
        }
        .run(handler)
    });

    (
        ManagedLoopHandle {
            name,
            cancel,
            handle: Some(handle),
        },
        watch,
    )
}

struct ManagedLoop<C: GroupCoordinator> {
    manager: Arc<GenerationManager<C>>,
    topic: String,
    poll_interval: Duration,
    cancel: CancellationToken,
    stats: LoopStats,
}

enum Exit {
    Rejoin,
    Stop,
}

impl<C: GroupCoordinator> ManagedLoop<C> {
    fn run<F, E>(mut self, mut handler: F) -> LoopStats
    where
        F: FnMut(&EventEnvelope) -> Result<(), E>,
        E: Display,
    {
        let backoff = reconnect_backoff();
        let mut failures = 0u32;

        loop {
            let generation = match self.manager.join_or_advance_generation(&self.cancel) {
                Ok(generation) => generation,
                Err(GroupError::Cancelled | GroupError::Closed) => break,
                Err(e) => {
                    let delay = backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    error!(
                        group = self.manager.group_id(),
                        topic = %self.topic,
                        error = %e,
                        retry_in = ?delay,
                        "failed to join consumer group"
                    );
                    if self.cancel.sleep(delay) {
                        break;
                    }
                    continue;
                }
            };
            failures = 0;
            self.stats.generations += 1;

            match self.consume(&generation, &mut handler) {
                Exit::Rejoin => continue,
                Exit::Stop => break,
            }
        }

        if let Err(e) = self.manager.leave() {
            warn!(group = self.manager.group_id(), error = %e, "failed to leave consumer group");
        }
        info!(
            group = self.manager.group_id(),
            topic = %self.topic,
            handled = self.stats.handled,
            failed = self.stats.failed,
            commits = self.stats.commits,
            "managed loop stopped"
        );
        self.stats
    }

    /// Read under one generation until it ends or the loop is stopped.
    fn consume<F, E>(&mut self, generation: &Generation, handler: &mut F) -> Exit
    where
        F: FnMut(&EventEnvelope) -> Result<(), E>,
        E: Display,
    {
        let backoff = reconnect_backoff();
        let mut failures = 0u32;
        let mut reached: BTreeMap<Partition, Offset> = BTreeMap::new();
        let mut uncommitted = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                self.commit_reached(generation, &mut reached);
                return Exit::Stop;
            }

            match self
                .manager
                .coordinator()
                .fetch(generation, self.poll_interval)
            {
                Ok(message) => {
                    failures = 0;
                    match message.envelope() {
                        Ok(envelope) => match handler(&envelope) {
                            Ok(()) => self.stats.handled += 1,
                            Err(e) => {
                                self.stats.failed += 1;
                                warn!(
                                    topic = %message.topic,
                                    partition = message.partition,
                                    offset = message.offset,
                                    order_id = envelope.order.order_id,
                                    kind = %envelope.kind,
                                    error = %e,
                                    "handler failed; skipping"
                                );
                            }
                        },
                        Err(e) => {
                            self.stats.failed += 1;
                            warn!(error = %e, "skipping undecodable record");
                        }
                    }

                    reached.insert(message.partition, message.next_offset());
                    uncommitted += 1;
                    if uncommitted >= COMMIT_EVERY {
                        self.commit_reached(generation, &mut reached);
                        uncommitted = 0;
                    }
                }
                Err(ReadError::Timeout) => {
                    if uncommitted > 0 {
                        self.commit_reached(generation, &mut reached);
                        uncommitted = 0;
                    }
                }
                Err(ReadError::GenerationEnded) => {
                    info!(
                        group = self.manager.group_id(),
                        topic = %self.topic,
                        generation = %generation.epoch,
                        "generation ended; committing and rejoining"
                    );
                    self.commit_reached(generation, &mut reached);
                    return Exit::Rejoin;
                }
                Err(ReadError::ConnectionLost(reason)) => {
                    let delay = backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(topic = %self.topic, %reason, retry_in = ?delay, "fetch failed");
                    if self.cancel.sleep(delay) {
                        self.commit_reached(generation, &mut reached);
                        return Exit::Stop;
                    }
                }
                Err(ReadError::Closed) => return Exit::Stop,
                Err(e) => warn!(topic = %self.topic, error = %e, "fetch failed"),
            }
        }
    }

    /// Commit every partition's reached offset under `generation`.
    fn commit_reached(&mut self, generation: &Generation, reached: &mut BTreeMap<Partition, Offset>) {
        for (partition, offset) in std::mem::take(reached) {
            match self
                .manager
                .commit_offset(generation, &self.topic, partition, offset)
            {
                Ok(()) => self.stats.commits += 1,
                Err(e) if e.requires_rejoin() => {
                    debug!(partition, offset, error = %e, "dropping commit for ended generation");
                }
                // Logged by the manager; the records will be redelivered.
                Err(_) => {}
            }
        }
    }
}
