//! Entity identifiers and identity hashing.
//!
//! An [`Entity`] is a context-scoped value record. Its identity is a 160-bit
//! SHA-1 digest over `(node id, world id, context id, token)`, where the
//! token is a process-unique counter. Two entities are equal iff their
//! digests are equal, which makes the digest cheap to use as a primary key
//! across every index in the store.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};

// ---------------------------------------------------------------------------
// Process-unique identifiers
// ---------------------------------------------------------------------------

/// Per-process node identifier, folded into every entity hash so that two
/// processes never mint colliding entities.
static NODE_ID: Lazy<[u8; 8]> = Lazy::new(|| {
    let mut hasher = Sha1::new();
    hasher.update(std::process::id().to_le_bytes());
    let boot = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    hasher.update(boot.to_le_bytes());
    let digest = hasher.finalize();
    let mut node = [0u8; 8];
    node.copy_from_slice(&digest[..8]);
    node
});

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);
static NEXT_WORLD: AtomicU64 = AtomicU64::new(1);

/// Opaque handle of the [`Context`](crate::context::Context) that owns an
/// entity. Entities never outlive their context; the handle is a relation,
/// not an ownership edge.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a fresh, process-unique context handle.
    pub fn fresh() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw `u64` representation.
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

/// Opaque handle of the world an entity is bound to, if any.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorldId(u64);

impl WorldId {
    /// Allocate a fresh, process-unique world handle.
    pub fn fresh() -> Self {
        Self(NEXT_WORLD.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw `u64` representation.
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorldId({})", self.0)
    }
}

/// Process-unique opaque token minted once per created entity. The token is
/// what makes two otherwise identical `(node, world, context)` tuples hash
/// to distinct entities.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityToken(u64);

impl EntityToken {
    fn fresh() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw `u64` representation.
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EntityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityToken({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityHash
// ---------------------------------------------------------------------------

/// 160-bit entity identity digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHash([u8; 20]);

impl EntityHash {
    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex rendering of the digest.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(40);
        for byte in self.0 {
            use fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

impl fmt::Display for EntityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EntityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first 4 bytes are plenty to tell entities apart in test output.
        write!(f, "EntityHash({}..)", &self.to_hex()[..8])
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A context-scoped entity.
///
/// Entities are plain value records: cloning one clones the handle, not the
/// stored components. The `parent` back-reference is shallow; destroying a
/// parent does not destroy its children.
#[derive(Clone)]
pub struct Entity {
    hash: EntityHash,
    token: EntityToken,
    name: Option<String>,
    parent: Option<Arc<Entity>>,
    context: ContextId,
    world: Option<WorldId>,
}

impl Entity {
    /// Mint a new entity bound to `context`. Only the owning store creates
    /// entities; everything else receives them.
    pub(crate) fn new(
        context: ContextId,
        name: Option<String>,
        parent: Option<Entity>,
        world: Option<WorldId>,
    ) -> Self {
        let token = EntityToken::fresh();
        let hash = Self::compute_hash(context, world, token);
        Self {
            hash,
            token,
            name,
            parent: parent.map(Arc::new),
            context,
            world,
        }
    }

    fn compute_hash(context: ContextId, world: Option<WorldId>, token: EntityToken) -> EntityHash {
        let mut hasher = Sha1::new();
        hasher.update(*NODE_ID);
        hasher.update(world.map_or(0, WorldId::to_raw).to_le_bytes());
        hasher.update(context.to_raw().to_le_bytes());
        hasher.update(token.to_raw().to_le_bytes());
        EntityHash(hasher.finalize().into())
    }

    /// The 160-bit identity digest.
    pub fn hash(&self) -> EntityHash {
        self.hash
    }

    /// The process-unique creation token.
    pub fn token(&self) -> EntityToken {
        self.token
    }

    /// The entity's name, if one was registered at creation.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The entity this one was cloned from, if any.
    pub fn parent(&self) -> Option<&Entity> {
        self.parent.as_deref()
    }

    /// Handle of the owning context.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Handle of the owning world, if the entity is world-bound.
    pub fn world(&self) -> Option<WorldId> {
        self.world
    }

    /// Identity comparison. Same as `==`; kept as a named predicate.
    pub fn equal(&self, other: &Entity) -> bool {
        self.hash == other.hash
    }

    /// Whether both entities live in the same context.
    pub fn colocated(&self, other: &Entity) -> bool {
        self.context == other.context
    }

    /// Whether the entity carries a registered name.
    pub fn is_named(&self) -> bool {
        self.name.is_some()
    }

    /// Whether this entity was cloned (directly) from `other`.
    pub fn is_child_of(&self, other: &Entity) -> bool {
        self.parent
            .as_ref()
            .is_some_and(|p| p.hash == other.hash)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Entity");
        dbg.field("hash", &self.hash);
        if let Some(name) = &self.name {
            dbg.field("name", name);
        }
        dbg.field("context", &self.context).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
