//! Prefab templates with single-inheritance property merging.
//!
//! A prefab is a named template entity living in the registry's dedicated
//! prefab context. It declares a component list (alias → properties) and an
//! `extends` list of parent prefabs. Registration resolves the whole chain
//! eagerly: parents are folded left-to-right (later parents overwrite whole
//! component entries), then the child's own properties are merged over the
//! inherited ones one level deep (child wins per key; whole values replace,
//! never recurse). Deeper inheritance is just the transitive closure of
//! single-level `extends` lists, because every parent was itself resolved
//! when it registered.
//!
//! Instantiation is the ordinary clone algorithm run against the prefab
//! context (see [`Registry::clone_entity`]).

use std::collections::BTreeMap;

use serde_json::{json, Value};

use tessera_ecs::component::{Component, ComponentTypeId, PropMap};
use tessera_ecs::context::Context;
use tessera_ecs::entity::{Entity, WorldId};
use tessera_ecs::store::EntityOptions;
use tessera_ecs::StoreError;

use crate::registry::Registry;
use crate::EngineError;

// ---------------------------------------------------------------------------
// PrefabSpec
// ---------------------------------------------------------------------------

/// Declaration of one prefab.
#[derive(Clone, Debug, Default)]
pub struct PrefabSpec {
    /// Name, unique within the prefab catalogue.
    pub name: String,
    /// Parent prefab names, merged left-to-right.
    pub extends: Vec<String>,
    /// Own components: `(alias, raw properties)`.
    pub components: Vec<(String, Value)>,
}

impl PrefabSpec {
    /// A prefab with no parents and no components.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a parent prefab.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends.push(parent.into());
        self
    }

    /// Declare a component.
    pub fn with(mut self, alias: impl Into<String>, props: Value) -> Self {
        self.components.push((alias.into(), props));
        self
    }
}

// ---------------------------------------------------------------------------
// Registration and instantiation
// ---------------------------------------------------------------------------

impl Registry {
    /// Register a prefab, resolving its inheritance chain now.
    ///
    /// Fails with [`EngineError::AlreadyRegistered`] when the name is taken
    /// and [`EngineError::PrefabNotFound`] when a parent is missing.
    ///
    /// # Panics
    ///
    /// Panics if a declared component references an unregistered alias.
    pub fn register_prefab(&self, spec: PrefabSpec) -> Result<Entity, EngineError> {
        let prefabs = self.prefabs();
        if prefabs.exists_named(&spec.name) {
            return Err(EngineError::AlreadyRegistered { name: spec.name });
        }

        // Fold the parents' resolved components, later parents overwriting
        // whole entries on conflict.
        let mut resolved: BTreeMap<ComponentTypeId, Component> = BTreeMap::new();
        for parent in &spec.extends {
            let (_, components) =
                prefabs
                    .fetch_named(parent)
                    .ok_or_else(|| EngineError::PrefabNotFound {
                        name: parent.clone(),
                    })?;
            for component in components {
                resolved.insert(component.type_id(), component);
            }
        }

        // Merge the child's declarations over the inherited entries.
        let snapshot = self.snapshot();
        for (alias, props) in &spec.components {
            let registered = snapshot.by_alias(alias).unwrap_or_else(|| {
                panic!("prefab '{}' declares unknown component alias '{alias}'", spec.name)
            });
            let cast = registered.cast(props);
            match resolved.remove(&registered.id()) {
                Some(inherited) => {
                    resolved.insert(registered.id(), inherited.merge_props(cast));
                }
                None => {
                    resolved.insert(registered.id(), registered.from_props(cast));
                }
            }
        }

        let mut metadata = PropMap::new();
        metadata.insert("extends".to_owned(), json!(spec.extends));
        let components: Vec<Component> = resolved.into_values().collect();
        let name = spec.name;

        // Create-and-assign on the writer thread, so a half-registered
        // prefab is never observable.
        prefabs.execute(move |store| {
            let entity = store.create(EntityOptions {
                name: Some(name),
                metadata,
                ..Default::default()
            })?;
            store.assign(&entity, components)?;
            Ok::<Entity, StoreError>(entity)
        })
        .map_err(EngineError::from)
    }

    /// Materialise a prefab into `target`, applying `overrides` on top.
    pub fn instantiate(
        &self,
        name: &str,
        overrides: &[(String, Value)],
        target: &Context,
        world: Option<WorldId>,
    ) -> Result<Entity, EngineError> {
        let (template, _) =
            self.prefabs()
                .fetch_named(name)
                .ok_or_else(|| EngineError::PrefabNotFound {
                    name: name.to_owned(),
                })?;
        self.clone_entity(self.prefabs(), &template, target, overrides, world)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
