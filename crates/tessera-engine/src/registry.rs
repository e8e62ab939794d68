//! The component registry.
//!
//! The registry assigns every component type its [`ComponentTypeId`], keeps
//! the ordered catalogue keyed by alias, and derives the per-event handler
//! order: for each event name, the component types that declared it, in
//! registration order. Handler order is append-only -- registering a second
//! batch never reorders what an earlier batch established.
//!
//! Reads go through a snapshot cell. Dispatch-time lookups clone an `Arc`
//! out of a read lock and then work lock-free on the immutable snapshot;
//! registration swaps in a rebuilt snapshot. It also owns the prefab
//! catalogue, a dedicated context of template entities (see
//! [`prefab`](crate::prefab)).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use tessera_ecs::component::{Component, ComponentType, ComponentTypeId, PropMap};
use tessera_ecs::context::Context;
use tessera_ecs::entity::{Entity, WorldId};
use tessera_ecs::event::EventName;
use tessera_ecs::store::EntityOptions;
use tessera_ecs::StoreError;

use crate::EngineError;

// ---------------------------------------------------------------------------
// RegisteredComponent
// ---------------------------------------------------------------------------

/// A component type together with its registry-assigned identity.
#[derive(Clone)]
pub struct RegisteredComponent {
    id: ComponentTypeId,
    alias: String,
    events: Vec<EventName>,
    kind: Arc<dyn ComponentType>,
}

impl RegisteredComponent {
    /// The assigned type identifier.
    pub fn id(&self) -> ComponentTypeId {
        self.id
    }

    /// The registered alias.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The declared event list.
    pub fn events(&self) -> &[EventName] {
        &self.events
    }

    /// The capability handle.
    pub fn kind(&self) -> &Arc<dyn ComponentType> {
        &self.kind
    }

    /// Validate raw properties and build a component value.
    pub fn new_component(&self, props: &Value) -> Component {
        let props = self.kind.cast(props);
        Component::new(self.id, Arc::clone(&self.kind), props)
    }

    /// Build a component from an already-validated property map.
    pub fn from_props(&self, props: PropMap) -> Component {
        Component::new(self.id, Arc::clone(&self.kind), props)
    }

    /// Normalise raw properties without building a component.
    pub fn cast(&self, props: &Value) -> PropMap {
        self.kind.cast(props)
    }
}

impl fmt::Debug for RegisteredComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredComponent")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("events", &self.events)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RegistrySnapshot
// ---------------------------------------------------------------------------

/// An immutable view of the registry, cheap to share with dispatch workers.
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    catalogue: Vec<RegisteredComponent>,
    by_alias: HashMap<String, usize>,
    by_id: HashMap<ComponentTypeId, usize>,
    handlers: HashMap<EventName, Vec<ComponentTypeId>>,
}

impl RegistrySnapshot {
    /// The catalogue in registration order.
    pub fn catalogue(&self) -> &[RegisteredComponent] {
        &self.catalogue
    }

    /// Look up a type by alias.
    pub fn by_alias(&self, alias: &str) -> Option<&RegisteredComponent> {
        self.by_alias.get(alias).map(|i| &self.catalogue[*i])
    }

    /// Look up a type by assigned identifier.
    pub fn by_id(&self, id: ComponentTypeId) -> Option<&RegisteredComponent> {
        self.by_id.get(&id).map(|i| &self.catalogue[*i])
    }

    /// Handler order for an event: every type that declared it, in
    /// registration order.
    pub fn handlers_for(&self, event: &str) -> &[ComponentTypeId] {
        self.handlers.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Registered aliases in registration order.
    pub fn aliases(&self) -> Vec<&str> {
        self.catalogue.iter().map(|r| r.alias()).collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Component and prefab catalogue.
///
/// The registry is an owned value rather than process-global state; tests
/// instantiate their own. Worlds share one through an `Arc`.
pub struct Registry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    prefabs: Context,
    next_type: AtomicU32,
}

impl Registry {
    /// An empty registry with its own prefab context.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            prefabs: Context::new(),
            next_type: AtomicU32::new(0),
        }
    }

    /// The current immutable snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// The prefab catalogue context.
    pub fn prefabs(&self) -> &Context {
        &self.prefabs
    }

    /// Register a batch of component types.
    ///
    /// Each type gets a fresh [`ComponentTypeId`]; the event-handler lookup
    /// is extended by appending, so handler order across batches is the
    /// overall registration order. Duplicate aliases -- within the batch or
    /// against earlier batches -- are rejected.
    ///
    /// # Panics
    ///
    /// Panics if a type declares an invalid alias (empty, or not a
    /// lower-case identifier). An invalid component definition is a
    /// programming error, not a recoverable condition.
    pub fn register_components(
        &self,
        kinds: Vec<Arc<dyn ComponentType>>,
    ) -> Result<Vec<ComponentTypeId>, EngineError> {
        let mut cell = self.snapshot.write();
        let mut next = RegistrySnapshot::clone(&**cell);
        let mut assigned = Vec::with_capacity(kinds.len());

        for kind in kinds {
            let alias = kind.name().to_owned();
            assert!(
                is_valid_alias(&alias),
                "component alias '{alias}' must be a lower-case identifier"
            );
            if next.by_alias.contains_key(&alias) {
                return Err(EngineError::AlreadyRegistered { name: alias });
            }
            let id = ComponentTypeId::from_raw(self.next_type.fetch_add(1, Ordering::Relaxed));
            let events = kind.events();
            for event in &events {
                next.handlers.entry(event.clone()).or_default().push(id);
            }
            let index = next.catalogue.len();
            next.by_alias.insert(alias.clone(), index);
            next.by_id.insert(id, index);
            next.catalogue.push(RegisteredComponent {
                id,
                alias: alias.clone(),
                events,
                kind,
            });
            debug!(alias = %alias, id = id.to_raw(), "registered component type");
            assigned.push(id);
        }

        *cell = Arc::new(next);
        Ok(assigned)
    }

    /// Look up a registered type by alias.
    pub fn lookup(&self, alias: &str) -> Option<RegisteredComponent> {
        self.snapshot.read().by_alias(alias).cloned()
    }

    /// Look up a registered type by identifier.
    pub fn get(&self, id: ComponentTypeId) -> Option<RegisteredComponent> {
        self.snapshot.read().by_id(id).cloned()
    }

    /// Drop every registered type and prefab. Meant for tests.
    pub fn reset(&self) {
        *self.snapshot.write() = Arc::new(RegistrySnapshot::default());
        self.prefabs.clear();
    }

    // -- cloning ------------------------------------------------------------

    /// Clone `source` from `source_ctx` into `target_ctx`.
    ///
    /// The new entity's parent is the source entity. Source components are
    /// converted to property maps, `overrides` (keyed by alias) are merged
    /// on top one level deep, and the resulting set is assigned in a single
    /// call.
    ///
    /// # Panics
    ///
    /// Panics if an override references an alias that is not registered.
    pub fn clone_entity(
        &self,
        source_ctx: &Context,
        source: &Entity,
        target_ctx: &Context,
        overrides: &[(String, Value)],
        world: Option<WorldId>,
    ) -> Result<Entity, EngineError> {
        let (source_entity, components) =
            source_ctx
                .fetch(source)
                .ok_or(StoreError::EntityNotFound {
                    hash: source.hash(),
                })?;

        let snapshot = self.snapshot();
        let mut merged: BTreeMap<ComponentTypeId, Component> = components
            .into_iter()
            .map(|c| (c.type_id(), c))
            .collect();
        for (alias, props) in overrides {
            let registered = snapshot.by_alias(alias).unwrap_or_else(|| {
                panic!("override references unknown component alias '{alias}'")
            });
            let cast = registered.cast(props);
            match merged.remove(&registered.id()) {
                Some(existing) => {
                    merged.insert(registered.id(), existing.merge_props(cast));
                }
                None => {
                    merged.insert(registered.id(), registered.from_props(cast));
                }
            }
        }

        let entity = target_ctx.create(EntityOptions {
            parent: Some(source_entity),
            world,
            ..Default::default()
        })?;
        target_ctx.assign(&entity, merged.into_values().collect())?;
        Ok(entity)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Registry")
            .field("components", &snapshot.catalogue.len())
            .field("prefabs", &self.prefabs.len())
            .finish()
    }
}

fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && alias
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
