//! Tessera Engine -- event dispatch over the Tessera ECS.
//!
//! This crate binds the storage core ([`tessera_ecs`]) to behaviour: a
//! [`Registry`](registry::Registry) of component types with a stable
//! per-event handler order, prefab templates with single-inheritance
//! property merging, and a [`World`](world::World) that routes events
//! through a partitioned herald → envoy → scribe pipeline with per-entity
//! FIFO delivery and cross-entity parallelism.
//!
//! # Quick Start
//!
//! ```
//! use tessera_engine::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Position;
//!
//! impl ComponentType for Position {
//!     fn name(&self) -> &str { "position" }
//!     fn events(&self) -> Vec<EventName> { vec!["moved".to_owned()] }
//! }
//!
//! let registry = Arc::new(Registry::new());
//! registry
//!     .register_components(vec![Arc::new(Position) as Arc<dyn ComponentType>])
//!     .unwrap();
//!
//! let world = World::new(registry);
//! let entity = world.create().unwrap();
//! let position = world.registry().lookup("position").unwrap();
//! world
//!     .context()
//!     .emplace(&entity, position.new_component(&json!({"x": 0, "y": 0})))
//!     .unwrap();
//!
//! world.send(&entity, "moved", PropMap::new()).unwrap();
//! world.flush(Duration::from_secs(1)).unwrap();
//! ```

#![deny(unsafe_code)]

mod pipeline;
pub mod prefab;
pub mod registry;
pub mod world;

use std::time::Duration;

use tessera_ecs::StoreError;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the storage core for convenience.
pub use tessera_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by registry, prefab, and world operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// A storage-core error, passed through unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The component alias or prefab name is taken.
    #[error("'{name}' is already registered")]
    AlreadyRegistered {
        /// The conflicting name.
        name: String,
    },

    /// No prefab is registered under this name.
    #[error("prefab '{name}' not found")]
    PrefabNotFound {
        /// The missing prefab name.
        name: String,
    },

    /// `World::flush` did not drain in time.
    #[error("flush timed out after {timeout:?}")]
    FlushTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Everything from the storage core's prelude.
    pub use tessera_ecs::prelude::*;

    // Engine-specific exports.
    pub use crate::prefab::PrefabSpec;
    pub use crate::registry::{RegisteredComponent, Registry, RegistrySnapshot};
    pub use crate::world::{ListFormat, Listing, World, WorldOptions};
    pub use crate::EngineError;
}
