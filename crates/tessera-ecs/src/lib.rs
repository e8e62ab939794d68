//! Tessera ECS -- entity-component storage with bloom-mask archetypes.
//!
//! This crate provides the storage core of the Tessera runtime. Entities are
//! opaque, context-scoped identifiers; components are validated property
//! maps attached one-per-type; a [`Context`](context::Context) keeps four
//! coherent indexes over every attachment and serialises all mutation
//! through a single writer thread while readers go straight to the tables.
//!
//! Behaviour lives outside this crate: component types implement the
//! [`ComponentType`](component::ComponentType) capability contract, and the
//! companion engine crate routes events to them.
//!
//! # Quick Start
//!
//! ```
//! use tessera_ecs::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct Position;
//!
//! impl ComponentType for Position {
//!     fn name(&self) -> &str { "position" }
//!     fn events(&self) -> Vec<EventName> { Vec::new() }
//! }
//!
//! let ctx = Context::new();
//! let entity = ctx.create(EntityOptions::default()).unwrap();
//!
//! let kind: Arc<dyn ComponentType> = Arc::new(Position);
//! let props = kind.cast(&json!({"x": 10, "y": 20}));
//! let position = Component::new(ComponentTypeId::from_raw(0), kind, props);
//! ctx.emplace(&entity, position).unwrap();
//!
//! let stored = ctx.get(&entity, ComponentTypeId::from_raw(0)).unwrap();
//! assert_eq!(stored.get("x"), Some(&json!(10)));
//! ```

#![deny(unsafe_code)]

pub mod bloom;
pub mod component;
pub mod context;
pub mod entity;
pub mod event;
pub mod query;
pub mod store;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
///
/// These are the recoverable kinds callers pattern-match on. Caller bugs
/// (non-map properties, empty match sets, inverted bounds) and system bugs
/// (event drift, malformed handler returns) panic instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The entity does not exist in this context.
    #[error("entity {hash} not found in this context")]
    EntityNotFound {
        /// Identity digest of the missing entity.
        hash: entity::EntityHash,
    },

    /// The requested entity name is taken.
    #[error("entity name '{name}' is already registered")]
    NameAlreadyRegistered {
        /// The conflicting name.
        name: String,
    },

    /// The entity already carries a component of this type.
    #[error("component '{alias}' is already inserted on entity {hash}")]
    AlreadyInserted {
        /// Identity digest of the entity.
        hash: entity::EntityHash,
        /// Alias of the conflicting component type.
        alias: String,
    },

    /// The entity carries no component of this type.
    #[error("component type {type_id:?} not found on entity {hash}")]
    ComponentNotFound {
        /// Identity digest of the entity.
        hash: entity::EntityHash,
        /// The missing component type.
        type_id: component::ComponentTypeId,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::bloom::BloomMask;
    pub use crate::component::{Component, ComponentType, ComponentTypeId, Hook, PropMap};
    pub use crate::context::Context;
    pub use crate::entity::{ContextId, Entity, EntityHash, WorldId};
    pub use crate::event::{Event, EventChecksum, EventName, Flow};
    pub use crate::store::{EntityOptions, EntityRecord, HookCall, Metadata, Store};
    pub use crate::StoreError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
