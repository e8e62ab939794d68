//! The world: one context bound to one dispatch pipeline.
//!
//! A [`World`] is the façade application code talks to. It owns a
//! [`Context`] for storage, shares a [`Registry`] for component and prefab
//! lookups, and runs a pipeline for event dispatch. `send` resolves the
//! handler order at send time: the event's registered handler list is
//! intersected with the types the target entity actually carries, in
//! registration order, and the frozen result travels with the event.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use tessera_ecs::component::{Component, ComponentTypeId, PropMap};
use tessera_ecs::context::Context;
use tessera_ecs::entity::{Entity, WorldId};
use tessera_ecs::event::Event;
use tessera_ecs::store::{EntityOptions, Store};
use tessera_ecs::StoreError;

use crate::pipeline::{Pipeline, PipelineConfig};
use crate::registry::Registry;
use crate::EngineError;

// ---------------------------------------------------------------------------
// WorldOptions
// ---------------------------------------------------------------------------

/// Fallback partition count when the host's parallelism is unknown.
const DEFAULT_PARTITIONS: NonZeroUsize = match NonZeroUsize::new(4) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Configuration for one world.
#[derive(Clone, Copy, Debug)]
pub struct WorldOptions {
    /// Pipeline partitions. Non-zero by construction; defaults to the
    /// machine's available parallelism.
    pub partitions: NonZeroUsize,
    /// Per-partition cap on buffered events and in-flight batches.
    pub max_events: usize,
}

impl Default for WorldOptions {
    fn default() -> Self {
        Self {
            partitions: std::thread::available_parallelism().unwrap_or(DEFAULT_PARTITIONS),
            max_events: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Output shape for [`World::list`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListFormat {
    /// A flat vector of `(entity, components)` tuples.
    List,
    /// A map keyed by entity.
    Map,
}

/// Every entity in the world with its components.
#[derive(Clone, Debug)]
pub enum Listing {
    /// Flat form.
    List(Vec<(Entity, Vec<Component>)>),
    /// Keyed form.
    Map(HashMap<Entity, Vec<Component>>),
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// One context plus one pipeline. Dropping the world tears both down.
pub struct World {
    id: WorldId,
    context: Context,
    registry: Arc<Registry>,
    pipeline: Pipeline,
    epoch: Instant,
}

impl World {
    /// A world with default options.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_options(registry, WorldOptions::default())
    }

    /// A world with explicit pipeline options.
    ///
    /// # Panics
    ///
    /// Panics if `max_events` is zero.
    pub fn with_options(registry: Arc<Registry>, options: WorldOptions) -> Self {
        let pipeline = Pipeline::start(
            Arc::clone(&registry),
            PipelineConfig {
                partitions: options.partitions,
                max_events: options.max_events,
            },
        );
        Self {
            id: WorldId::fresh(),
            context: Context::new(),
            registry,
            pipeline,
            epoch: Instant::now(),
        }
    }

    /// Handle of this world.
    pub fn id(&self) -> WorldId {
        self.id
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Raw context handle, for dirty reads outside the façade.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Run a compound write on the context's writer thread.
    pub fn with_context<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut Store) -> R + Send + 'static,
    {
        self.context.execute(f)
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Create a bare entity bound to this world.
    pub fn create(&self) -> Result<Entity, EngineError> {
        Ok(self.context.create(EntityOptions {
            world: Some(self.id),
            ..Default::default()
        })?)
    }

    /// Create a named entity bound to this world.
    pub fn create_named(&self, name: impl Into<String>) -> Result<Entity, EngineError> {
        Ok(self.context.create(EntityOptions {
            name: Some(name.into()),
            world: Some(self.id),
            ..Default::default()
        })?)
    }

    /// Materialise a registered prefab, with `overrides` merged on top.
    pub fn create_from(
        &self,
        prefab: &str,
        overrides: &[(String, Value)],
    ) -> Result<Entity, EngineError> {
        self.registry
            .instantiate(prefab, overrides, &self.context, Some(self.id))
    }

    /// Clone an entity of this world, with `overrides` merged on top.
    pub fn clone_entity(
        &self,
        source: &Entity,
        overrides: &[(String, Value)],
    ) -> Result<Entity, EngineError> {
        self.registry
            .clone_entity(&self.context, source, &self.context, overrides, Some(self.id))
    }

    /// Destroy an entity.
    pub fn destroy(&self, entity: &Entity) -> Result<(), EngineError> {
        Ok(self.context.destroy(entity)?)
    }

    /// The entity and its components.
    pub fn fetch(&self, entity: &Entity) -> Option<(Entity, Vec<Component>)> {
        self.context.fetch(entity)
    }

    /// Whether the entity exists.
    pub fn exists(&self, entity: &Entity) -> bool {
        self.context.exists(entity)
    }

    /// Every entity with its components, in the requested shape.
    pub fn list(&self, format: ListFormat) -> Listing {
        let joined = self.context.entities();
        match format {
            ListFormat::List => Listing::List(joined),
            ListFormat::Map => Listing::Map(joined.into_iter().collect()),
        }
    }

    // -- query passthroughs -------------------------------------------------

    /// Every `(entity, component)` pair of one type.
    pub fn all(&self, type_id: ComponentTypeId) -> Vec<(Entity, Component)> {
        self.context.all(type_id)
    }

    /// Exact property match over one type's rows.
    pub fn match_props(&self, type_id: ComponentTypeId, props: &PropMap) -> Vec<(Entity, Component)> {
        self.context.match_props(type_id, props)
    }

    /// Numeric `>=` filter over one type's rows.
    pub fn at_least(&self, type_id: ComponentTypeId, prop: &str, value: f64) -> Vec<(Entity, Component)> {
        self.context.at_least(type_id, prop, value)
    }

    /// Numeric `<=` filter over one type's rows.
    pub fn at_most(&self, type_id: ComponentTypeId, prop: &str, value: f64) -> Vec<(Entity, Component)> {
        self.context.at_most(type_id, prop, value)
    }

    /// Numeric interval filter over one type's rows.
    pub fn between(
        &self,
        type_id: ComponentTypeId,
        prop: &str,
        lo: f64,
        hi: f64,
    ) -> Vec<(Entity, Component)> {
        self.context.between(type_id, prop, lo, hi)
    }

    /// Combined archetype search.
    pub fn search(
        &self,
        all: &[ComponentTypeId],
        any: &[ComponentTypeId],
        none: &[ComponentTypeId],
    ) -> Vec<Entity> {
        self.context.search(all, any, none)
    }

    // -- dispatch -----------------------------------------------------------

    /// Send an event to an entity.
    ///
    /// The handler list is the event's registered component order filtered
    /// to the types the entity carries right now. Events to one entity from
    /// one caller are handled in send order; events to distinct entities
    /// run in parallel.
    pub fn send(&self, entity: &Entity, event: &str, args: PropMap) -> Result<(), EngineError> {
        let record = self
            .context
            .info(entity)
            .ok_or(StoreError::EntityNotFound {
                hash: entity.hash(),
            })?;
        let snapshot = self.registry.snapshot();
        let handlers: Vec<ComponentTypeId> = snapshot
            .handlers_for(event)
            .iter()
            .copied()
            .filter(|type_id| record.types.contains(type_id))
            .collect();
        let timestamp = self.epoch.elapsed().as_nanos() as u64;
        self.pipeline.dispatch(Event::new(
            event.to_owned(),
            Some(self.id),
            record.entity,
            timestamp,
            args,
            handlers,
        ));
        Ok(())
    }

    /// Block until every event accepted so far has finished handling.
    pub fn flush(&self, timeout: Duration) -> Result<(), EngineError> {
        if self.pipeline.flush(timeout) {
            Ok(())
        } else {
            Err(EngineError::FlushTimeout { timeout })
        }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id)
            .field("entities", &self.context.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_ecs::component::ComponentType;
    use tessera_ecs::event::EventName;

    struct Kind {
        alias: &'static str,
    }

    impl ComponentType for Kind {
        fn name(&self) -> &str {
            self.alias
        }

        fn events(&self) -> Vec<EventName> {
            Vec::new()
        }
    }

    fn world() -> World {
        let registry = Arc::new(Registry::new());
        registry
            .register_components(vec![
                Arc::new(Kind { alias: "health" }) as Arc<dyn ComponentType>,
                Arc::new(Kind { alias: "position" }),
            ])
            .unwrap();
        World::new(registry)
    }

    #[test]
    fn created_entities_are_world_bound() {
        let w = world();
        let e = w.create().unwrap();
        assert_eq!(e.world(), Some(w.id()));
        assert!(w.exists(&e));
    }

    #[test]
    fn named_creation_and_lookup() {
        let w = world();
        let e = w.create_named("boss").unwrap();
        assert_eq!(w.context().lookup("boss").unwrap().entity, e);
    }

    #[test]
    fn clone_entity_keeps_parent_in_this_world() {
        let w = world();
        let health = w.registry().lookup("health").unwrap();
        let source = w.create().unwrap();
        w.context()
            .emplace(&source, health.new_component(&json!({"current": 80})))
            .unwrap();

        let copy = w
            .clone_entity(&source, &[("health".to_owned(), json!({"current": 10}))])
            .unwrap();
        assert!(copy.is_child_of(&source));
        assert_eq!(copy.world(), Some(w.id()));
        assert_eq!(
            w.context()
                .get(&copy, health.id())
                .unwrap()
                .get("current"),
            Some(&json!(10))
        );
        assert_eq!(w.context().children_of(&source), vec![copy]);
    }

    #[test]
    fn list_shapes() {
        let w = world();
        let a = w.create().unwrap();
        let _b = w.create().unwrap();

        match w.list(ListFormat::List) {
            Listing::List(rows) => assert_eq!(rows.len(), 2),
            Listing::Map(_) => panic!("asked for the flat shape"),
        }
        match w.list(ListFormat::Map) {
            Listing::Map(map) => {
                assert_eq!(map.len(), 2);
                assert!(map.contains_key(&a));
            }
            Listing::List(_) => panic!("asked for the keyed shape"),
        }
    }

    #[test]
    fn send_to_missing_entity_is_an_error() {
        let w = world();
        let e = w.create().unwrap();
        w.destroy(&e).unwrap();
        let err = w.send(&e, "anything", PropMap::new()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn flush_on_an_idle_world_returns_immediately() {
        let w = world();
        w.flush(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn with_context_commits_compound_writes() {
        let w = world();
        let health = w.registry().lookup("health").unwrap();
        let c = health.new_component(&json!({"current": 5}));
        let entity = w.with_context(move |store| {
            let entity = store.create(Default::default()).unwrap();
            store.emplace(&entity, c).unwrap();
            entity
        });
        assert_eq!(w.fetch(&entity).unwrap().1.len(), 1);
    }

    #[test]
    fn query_passthroughs_reach_the_context() {
        let w = world();
        let health = w.registry().lookup("health").unwrap();
        let e = w.create().unwrap();
        w.context()
            .emplace(&e, health.new_component(&json!({"current": 42})))
            .unwrap();

        assert_eq!(w.all(health.id()).len(), 1);
        assert_eq!(w.at_least(health.id(), "current", 40.0).len(), 1);
        assert_eq!(w.at_most(health.id(), "current", 40.0).len(), 0);
        assert_eq!(w.between(health.id(), "current", 40.0, 50.0).len(), 1);
        let mut props = PropMap::new();
        props.insert("current".to_owned(), json!(42));
        assert_eq!(w.match_props(health.id(), &props).len(), 1);
        assert_eq!(w.search(&[health.id()], &[], &[]), vec![e]);
    }
}
