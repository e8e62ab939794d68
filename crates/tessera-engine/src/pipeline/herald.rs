//! The herald: the pipeline's producer stage.
//!
//! The herald's unbounded inbox is the world-level FIFO queue; the bounded
//! lane channels downstream are the demand signal. A `send` into a full
//! lane parks the herald until that lane's envoy takes events off the
//! channel, which is exactly the demand-pull contract: the herald only
//! emits while downstream capacity exists.

use std::hash::Hasher;

use crossbeam_channel::{Receiver, Sender};
use siphasher::sip::SipHasher24;

use tessera_ecs::entity::EntityHash;
use tessera_ecs::event::Event;

/// Fixed keys for the partition hash. The partition function must be
/// deterministic across runs: every event for a given entity has to land on
/// the same lane, in this process and the next one.
const PARTITION_KEY: (u64, u64) = (0x6865_7261_6c64_2d30, 0x6865_7261_6c64_2d31);

/// Stable lane assignment for an entity.
pub(crate) fn partition_of(hash: EntityHash, partitions: usize) -> usize {
    let mut hasher = SipHasher24::new_with_keys(PARTITION_KEY.0, PARTITION_KEY.1);
    hasher.write(hash.as_bytes());
    (hasher.finish() % partitions as u64) as usize
}

/// Route events to lanes until the inbox closes.
pub(crate) fn run(inbox: Receiver<Event>, lanes: Vec<Sender<Event>>) {
    for event in inbox {
        let lane = partition_of(event.entity.hash(), lanes.len());
        if lanes[lane].send(event).is_err() {
            // The lane's envoy is gone; the pipeline is tearing down.
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
