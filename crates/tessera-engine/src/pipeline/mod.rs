//! The herald → envoy → scribe dispatch pipeline.
//!
//! One herald per world routes every event to one of `partitions` lanes by
//! a stable hash of the target entity, so all events for a given entity
//! always land on the same lane. Within a lane, the envoy serialises work
//! per entity (at most one batch per entity in flight) while the scribe runs
//! batches for distinct entities on parallel transient workers. Together
//! this yields the two guarantees the runtime is built around: per-entity
//! FIFO delivery and cross-entity parallelism.
//!
//! Backpressure is demand-pull end to end: lane channels are bounded, so a
//! saturated lane stalls the herald, and the scribe stops accepting batches
//! once its in-flight worker budget is spent. There are no timeouts inside
//! the pipeline; an event handler that never returns blocks only its own
//! entity's lane slot.

mod envoy;
mod herald;
mod scribe;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::{Condvar, Mutex};

use tessera_ecs::entity::Entity;
use tessera_ecs::event::Event;

use crate::registry::Registry;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tuning knobs for one pipeline.
#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    /// Number of partitions (lanes). Non-zero by construction.
    pub partitions: NonZeroUsize,
    /// Per-lane bound on buffered events and in-flight batches. Must be
    /// positive.
    pub max_events: usize,
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// One unit of downstream work: every queued event for one entity.
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) entity: Entity,
    pub(crate) events: Vec<Event>,
}

// ---------------------------------------------------------------------------
// PendingCounter
// ---------------------------------------------------------------------------

/// Count of accepted-but-unfinished events, for `World::flush`.
pub(crate) struct PendingCounter {
    count: Mutex<u64>,
    idle: Condvar,
}

impl PendingCounter {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn add(&self, n: u64) {
        *self.count.lock() += n;
    }

    pub(crate) fn sub(&self, n: u64) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(n);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until the count reaches zero. Returns `false` on timeout.
    pub(crate) fn wait_zero(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        !self
            .idle
            .wait_while_for(&mut count, |count| *count > 0, timeout)
            .timed_out()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Handle to a running pipeline. Dropping it closes the herald's inbox;
/// the stages wind down as their channels drain.
pub(crate) struct Pipeline {
    inbox: Sender<Event>,
    pending: Arc<PendingCounter>,
}

impl Pipeline {
    /// Spawn the herald, one envoy and one scribe per partition.
    pub(crate) fn start(registry: Arc<Registry>, config: PipelineConfig) -> Self {
        assert!(config.max_events > 0, "max_events must be positive");

        let pending = Arc::new(PendingCounter::new());
        let (inbox, herald_rx) = unbounded();

        let partitions = config.partitions.get();
        let mut lanes = Vec::with_capacity(partitions);
        for lane in 0..partitions {
            let (event_tx, event_rx) = bounded(config.max_events);
            let (ack_tx, ack_rx) = unbounded();
            let (batch_tx, batch_rx) = bounded(config.max_events);

            thread::Builder::new()
                .name(format!("envoy-{lane}"))
                .spawn(move || envoy::run(event_rx, ack_rx, batch_tx))
                .expect("spawn envoy");

            let registry = Arc::clone(&registry);
            let pending = Arc::clone(&pending);
            let max_in_flight = config.max_events;
            thread::Builder::new()
                .name(format!("scribe-{lane}"))
                .spawn(move || scribe::run(lane, batch_rx, ack_tx, registry, pending, max_in_flight))
                .expect("spawn scribe");

            lanes.push(event_tx);
        }

        thread::Builder::new()
            .name("herald".to_owned())
            .spawn(move || herald::run(herald_rx, lanes))
            .expect("spawn herald");

        Self { inbox, pending }
    }

    /// Hand an event to the herald.
    pub(crate) fn dispatch(&self, event: Event) {
        self.pending.add(1);
        if self.inbox.send(event).is_err() {
            self.pending.sub(1);
        }
    }

    /// Block until every accepted event has finished handling.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        self.pending.wait_zero(timeout)
    }
}
