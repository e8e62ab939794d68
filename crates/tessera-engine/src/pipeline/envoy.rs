//! The envoy: per-lane, per-entity serialisation.
//!
//! The envoy tracks a lane entry per entity it has work in flight for.
//! Incoming events are drained greedily, grouped by entity in arrival
//! order, and either emitted downstream (entity untracked: it becomes busy)
//! or appended to the entity's wait queue (entity busy). Acks from the
//! scribe's workers pop the wait queue; an empty queue retires the entry.
//!
//! The invariant carried here is the serialisation guarantee: at any moment
//! at most one batch per entity is downstream, so a single entity's events
//! are handled strictly in arrival order while unrelated entities overtake
//! each other freely.

use std::collections::{HashMap, VecDeque};

use crossbeam_channel::{select, Receiver, Sender};
use tracing::debug;

use tessera_ecs::entity::{Entity, EntityHash};
use tessera_ecs::event::Event;

use super::Batch;

struct Lane {
    entity: Entity,
    waiting: VecDeque<Vec<Event>>,
}

/// Lane event loop. Exits once the herald has closed the event channel and
/// every tracked entity has drained.
pub(crate) fn run(events: Receiver<Event>, acks: Receiver<EntityHash>, downstream: Sender<Batch>) {
    let mut lanes: HashMap<EntityHash, Lane> = HashMap::new();
    let mut events_open = true;

    loop {
        if events_open {
            select! {
                recv(events) -> msg => match msg {
                    Ok(first) => {
                        let mut drained = vec![first];
                        drained.extend(events.try_iter());
                        if intake(&mut lanes, drained, &downstream).is_err() {
                            return;
                        }
                    }
                    Err(_) => events_open = false,
                },
                recv(acks) -> msg => match msg {
                    Ok(hash) => {
                        if acknowledge(&mut lanes, hash, &downstream).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                },
            }
        } else if lanes.is_empty() {
            // Inbox closed and nothing in flight: wind down. Dropping the
            // downstream sender lets the scribe finish in turn.
            return;
        } else {
            match acks.recv() {
                Ok(hash) => {
                    if acknowledge(&mut lanes, hash, &downstream).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

/// Group a drained batch by entity (arrival order preserved) and emit or
/// queue each group.
fn intake(
    lanes: &mut HashMap<EntityHash, Lane>,
    drained: Vec<Event>,
    downstream: &Sender<Batch>,
) -> Result<(), ()> {
    let mut order: Vec<(EntityHash, Entity)> = Vec::new();
    let mut groups: HashMap<EntityHash, Vec<Event>> = HashMap::new();
    for event in drained {
        let hash = event.entity.hash();
        if !groups.contains_key(&hash) {
            order.push((hash, event.entity.clone()));
        }
        groups.entry(hash).or_default().push(event);
    }

    for (hash, entity) in order {
        let events = groups.remove(&hash).expect("group collected");
        match lanes.get_mut(&hash) {
            Some(lane) => lane.waiting.push_back(events),
            None => {
                lanes.insert(
                    hash,
                    Lane {
                        entity: entity.clone(),
                        waiting: VecDeque::new(),
                    },
                );
                downstream.send(Batch { entity, events }).map_err(drop)?;
            }
        }
    }
    Ok(())
}

/// A batch for `hash` finished downstream: release the next one or retire
/// the entry.
fn acknowledge(
    lanes: &mut HashMap<EntityHash, Lane>,
    hash: EntityHash,
    downstream: &Sender<Batch>,
) -> Result<(), ()> {
    match lanes.get_mut(&hash) {
        Some(lane) => match lane.waiting.pop_front() {
            Some(events) => {
                let entity = lane.entity.clone();
                downstream.send(Batch { entity, events }).map_err(drop)?;
            }
            None => {
                lanes.remove(&hash);
            }
        },
        None => debug!(entity = %hash, "ack for untracked entity"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
