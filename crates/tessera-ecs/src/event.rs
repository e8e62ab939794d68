//! Events and drift detection.
//!
//! An [`Event`] is a named record dispatched to one entity. Handlers may
//! transform its `args`; every other field is frozen for the lifetime of a
//! dispatch. The dispatcher snapshots a [`checksum`](Event::checksum) over
//! the frozen fields before the first handler runs and re-verifies it after
//! each handler returns, so a handler that accidentally rewrites `world`,
//! `entity`, or `timestamp` is caught on the next iteration.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::component::{ComponentTypeId, PropMap};
use crate::entity::{Entity, WorldId};

/// Event names are short symbolic identifiers; two names are equal iff they
/// are byte-equal.
pub type EventName = String;

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// A handler's verdict on event propagation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Pass the (possibly transformed) event to the next handler.
    Continue,
    /// Stop propagating this event; later handlers are skipped. The next
    /// event in the batch is unaffected.
    Halt,
}

// ---------------------------------------------------------------------------
// EventChecksum
// ---------------------------------------------------------------------------

/// Digest over an event's frozen fields.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventChecksum([u8; 20]);

impl fmt::Debug for EventChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventChecksum({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A named record dispatched to an entity.
///
/// `handlers` is the component-type order fixed at send time: the event's
/// registered handler list intersected with the types the target entity
/// actually carried, in registration order.
#[derive(Clone, Debug)]
pub struct Event {
    /// The event name.
    pub name: EventName,
    /// Handle of the world the event was sent through, if any.
    pub world: Option<WorldId>,
    /// The target entity.
    pub entity: Entity,
    /// Monotonic timestamp (nanoseconds since the sending world's epoch).
    pub timestamp: u64,
    /// Handler-transformable payload.
    pub args: PropMap,
    /// Component types to invoke, in registration order.
    pub handlers: Vec<ComponentTypeId>,
}

impl Event {
    /// Assemble an event. Dispatch infrastructure is the usual caller.
    pub fn new(
        name: EventName,
        world: Option<WorldId>,
        entity: Entity,
        timestamp: u64,
        args: PropMap,
        handlers: Vec<ComponentTypeId>,
    ) -> Self {
        Self {
            name,
            world,
            entity,
            timestamp,
            args,
            handlers,
        }
    }

    /// Digest over every field except `args`.
    pub fn checksum(&self) -> EventChecksum {
        let mut hasher = Sha1::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.world.map_or(0, WorldId::to_raw).to_le_bytes());
        hasher.update(self.entity.hash().as_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update((self.handlers.len() as u32).to_le_bytes());
        for handler in &self.handlers {
            hasher.update(handler.to_raw().to_le_bytes());
        }
        EventChecksum(hasher.finalize().into())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
