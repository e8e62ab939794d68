//! Fixed-parameter bloom masks for archetype filtering.
//!
//! Every entity's archetype (the set of component types it carries) is
//! approximated by a [`BloomMask`]: the bitwise OR of one per-type mask per
//! attached component. The archetype index keys on these masks, so set
//! queries can discard most entities with a couple of word-wide AND/OR
//! operations before touching the exact type sets.
//!
//! The per-type term is the pair of the type's registered alias and its
//! declared event list. Two types that register the same alias and events
//! collide here on purpose: the mask tracks type identity as declared to the
//! dispatcher, not the shape of the property data.
//!
//! Bit positions come from `SipHasher24` with fixed keys, so masks are
//! deterministic across runs and processes. Bloom filters admit false
//! positives and never false negatives; callers re-verify survivors against
//! the exact type set.

use std::fmt;
use std::hash::Hasher;
use std::ops::BitOr;

use siphasher::sip::SipHasher24;

use crate::event::EventName;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Number of hash rounds per term.
pub const HASH_COUNT: usize = 6;

/// Designed false-positive rate at capacity.
pub const TARGET_RATE: f64 = 0.01;

/// Designed number of distinct component types.
pub const CAPACITY: usize = 100;

/// Live bits per mask: `ceil(-HASH_COUNT * CAPACITY / ln(1 - TARGET_RATE^(1/HASH_COUNT)))`.
///
/// The formula is re-derived in a test so this constant cannot drift.
pub const BIT_COUNT: usize = 962;

const WORDS: usize = BIT_COUNT.div_ceil(64);

/// Fixed key for the bit-position hash. Changing it invalidates every
/// persisted mask comparison, so it never changes.
const BLOOM_KEY: u64 = 0x7465_7373_6572_6121;

/// Separator byte between the alias and each event in the hashed term.
const TERM_SEP: u8 = 0x1f;

// ---------------------------------------------------------------------------
// BloomMask
// ---------------------------------------------------------------------------

/// A fixed-width bloom mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BloomMask([u64; WORDS]);

impl BloomMask {
    /// The empty mask (empty archetype).
    pub const ZERO: BloomMask = BloomMask([0; WORDS]);

    /// Mask for a component type, from its registered alias and declared
    /// event list (in declaration order).
    pub fn for_type(alias: &str, events: &[EventName]) -> Self {
        let mut term = Vec::with_capacity(alias.len() + events.len() * 8 + events.len() + 1);
        term.extend_from_slice(alias.as_bytes());
        term.push(TERM_SEP);
        for event in events {
            term.extend_from_slice(event.as_bytes());
            term.push(TERM_SEP);
        }
        Self::from_term(&term)
    }

    fn from_term(term: &[u8]) -> Self {
        let mut mask = Self::ZERO;
        for round in 0..HASH_COUNT {
            let mut hasher = SipHasher24::new_with_keys(BLOOM_KEY, round as u64);
            hasher.write(term);
            let bit = (hasher.finish() % BIT_COUNT as u64) as usize;
            mask.0[bit / 64] |= 1u64 << (bit % 64);
        }
        mask
    }

    /// Bitwise-OR merge.
    pub fn merge(self, other: Self) -> Self {
        self | other
    }

    /// Whether every set bit of `other` is set in `self`.
    pub fn contains(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| a & b == *b)
    }

    /// Whether the two masks share any set bit.
    pub fn intersects(&self, other: &Self) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a & b != 0)
    }

    /// Whether no bit is set.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }
}

impl BitOr for BloomMask {
    type Output = BloomMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        let mut out = self;
        for (word, other) in out.0.iter_mut().zip(rhs.0.iter()) {
            *word |= other;
        }
        out
    }
}

impl Default for BloomMask {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for BloomMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BloomMask({} bits set)", self.count_ones())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
