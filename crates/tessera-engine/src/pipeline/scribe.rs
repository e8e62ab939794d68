//! The scribe: batch consumer and worker supervisor.
//!
//! For every batch the envoy releases, the scribe spawns one transient
//! worker. The worker walks the batch's events in order and, for each
//! event, the handler list in order, resolving each component type against
//! the registry snapshot, verifying the drift checksum after every handler
//! and honouring `Halt`. Demand is accounted with completion signals: the
//! scribe stops taking batches once `max_in_flight` workers are out, and a
//! worker's exit -- clean or panicked -- frees one slot.
//!
//! The worker's drop guard delivers the entity's ack to the envoy on every
//! exit path, so a crashing handler frees its entity's lane instead of
//! wedging it. Other entities are never affected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{select, Receiver, Sender};
use tracing::warn;

use tessera_ecs::entity::EntityHash;
use tessera_ecs::event::Flow;

use super::{Batch, PendingCounter};
use crate::registry::Registry;

/// Consume batches, bounding in-flight workers by `max_in_flight`.
pub(crate) fn run(
    lane: usize,
    batches: Receiver<Batch>,
    acks: Sender<EntityHash>,
    registry: Arc<Registry>,
    pending: Arc<PendingCounter>,
    max_in_flight: usize,
) {
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();
    let mut in_flight = 0usize;

    loop {
        while in_flight >= max_in_flight {
            match done_rx.recv() {
                Ok(()) => in_flight -= 1,
                Err(_) => return,
            }
        }
        select! {
            recv(batches) -> msg => match msg {
                Ok(batch) => {
                    spawn_worker(lane, batch, &acks, &done_tx, &registry, &pending);
                    in_flight += 1;
                }
                Err(_) => break,
            },
            recv(done_rx) -> msg => match msg {
                Ok(()) => in_flight -= 1,
                Err(_) => return,
            },
        }
    }

    // Envoy gone: wait out the stragglers so their acks are harmless.
    while in_flight > 0 {
        match done_rx.recv() {
            Ok(()) => in_flight -= 1,
            Err(_) => return,
        }
    }
}

fn spawn_worker(
    lane: usize,
    batch: Batch,
    acks: &Sender<EntityHash>,
    done: &Sender<()>,
    registry: &Arc<Registry>,
    pending: &Arc<PendingCounter>,
) {
    let guard = WorkerGuard {
        entity: batch.entity.hash(),
        events: batch.events.len() as u64,
        acks: acks.clone(),
        done: done.clone(),
        pending: Arc::clone(pending),
    };
    let registry = Arc::clone(registry);
    thread::Builder::new()
        .name(format!("scribe-worker-{lane}"))
        .spawn(move || {
            let _guard = guard;
            if catch_unwind(AssertUnwindSafe(|| process(batch, &registry))).is_err() {
                warn!(lane, "event handler crashed; entity lane released");
            }
        })
        .expect("spawn scribe worker");
}

/// Completion bookkeeping on every worker exit path, panics included.
struct WorkerGuard {
    entity: EntityHash,
    events: u64,
    acks: Sender<EntityHash>,
    done: Sender<()>,
    pending: Arc<PendingCounter>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let _ = self.acks.send(self.entity);
        let _ = self.done.send(());
        self.pending.sub(self.events);
    }
}

/// Run every event in the batch through its handler chain.
///
/// # Panics
///
/// Panics when a handler list names an unregistered type, or when a handler
/// returns an event whose frozen fields drifted. Both are system bugs; the
/// panic crashes this worker only.
fn process(batch: Batch, registry: &Registry) {
    let snapshot = registry.snapshot();
    for mut event in batch.events {
        let expected = event.checksum();
        let name = event.name.clone();
        for type_id in event.handlers.clone() {
            let registered = snapshot.by_id(type_id).unwrap_or_else(|| {
                panic!("unregistered component type {type_id:?} in handler list for event '{name}'")
            });
            match registered.kind().handle_event(&name, event.clone()) {
                // Handler not exported: treated as (Continue, unchanged).
                None => {}
                Some((flow, next)) => {
                    if next.checksum() != expected {
                        panic!(
                            "event '{name}' drifted during processing (handler '{}')",
                            registered.alias()
                        );
                    }
                    event = next;
                    if flow == Flow::Halt {
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
