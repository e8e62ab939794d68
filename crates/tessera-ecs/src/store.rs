//! The four-index entity/component store.
//!
//! [`Store`] is the single-threaded heart of a context. It keeps four
//! coherent views over every `(entity, type, component, metadata)` tuple:
//!
//! - `mtable` — entity hash → `(entity, types, metadata)`
//! - `ctable` — entity hash → component rows
//! - `tindex` — component type → component rows (the inversion of `ctable`)
//! - `nindex` — entity name → entity hash (injective)
//! - `aindex` — bloom mask → entity hashes, exactly one entry per live
//!   entity, mask = OR of the per-type masks of its archetype
//!
//! Every mutation either commits all of its index updates or none, so any
//! snapshot a reader takes between mutations is self-consistent. The
//! concurrent shell around this type lives in [`context`](crate::context).
//!
//! Mutations return the lifecycle [`HookCall`]s they triggered instead of
//! firing them inline; the caller runs them out-of-band, outside any lock.

use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::bloom::BloomMask;
use crate::component::{Component, ComponentTypeId, Hook, PropMap};
use crate::entity::{ContextId, Entity, EntityHash, WorldId};
use crate::StoreError;

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Per-entity opaque metadata: a caller-owned map plus an auto-set creation
/// timestamp. `patch` replaces the map wholesale and never merges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Unix nanoseconds at entity creation.
    pub created_at: u128,
    /// Caller-owned fields.
    pub fields: PropMap,
}

impl Metadata {
    fn now(fields: PropMap) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self { created_at, fields }
    }
}

// ---------------------------------------------------------------------------
// EntityOptions
// ---------------------------------------------------------------------------

/// Options for [`Store::create`].
#[derive(Clone, Debug, Default)]
pub struct EntityOptions {
    /// Context-unique name to register, if any.
    pub name: Option<String>,
    /// Entity this one is cloned from, if any.
    pub parent: Option<Entity>,
    /// World to bind the entity to, if any.
    pub world: Option<WorldId>,
    /// Initial metadata fields.
    pub metadata: PropMap,
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// The `mtable` row: an entity, its exact archetype, and its metadata.
#[derive(Clone, Debug)]
pub struct EntityRecord {
    /// The entity value.
    pub entity: Entity,
    /// Exact set of attached component types.
    pub types: BTreeSet<ComponentTypeId>,
    /// Entity metadata.
    pub metadata: Metadata,
}

/// One component attachment. The same row shape backs both `ctable`
/// (keyed by entity) and `tindex` (keyed by type).
#[derive(Clone, Debug)]
pub(crate) struct ComponentRow {
    pub(crate) hash: EntityHash,
    pub(crate) entity: Entity,
    pub(crate) type_id: ComponentTypeId,
    pub(crate) component: Component,
}

// ---------------------------------------------------------------------------
// HookCall
// ---------------------------------------------------------------------------

/// A deferred lifecycle notification produced by a successful mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct HookCall {
    /// Which lifecycle transition happened.
    pub hook: Hook,
    /// The affected entity.
    pub entity: Entity,
    /// The component as of the mutation (the removed value for `Removed`).
    pub component: Component,
}

impl HookCall {
    fn new(hook: Hook, entity: &Entity, component: &Component) -> Self {
        Self {
            hook,
            entity: entity.clone(),
            component: component.clone(),
        }
    }

    /// Invoke the component type's `on_hook`.
    pub fn fire(&self) {
        self.component
            .kind()
            .on_hook(self.hook, &self.entity, &self.component);
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The four coherent indexes of one context.
pub struct Store {
    pub(crate) context: ContextId,
    pub(crate) mtable: HashMap<EntityHash, EntityRecord>,
    pub(crate) ctable: HashMap<EntityHash, Vec<ComponentRow>>,
    pub(crate) tindex: HashMap<ComponentTypeId, Vec<ComponentRow>>,
    pub(crate) nindex: HashMap<String, EntityHash>,
    pub(crate) aindex: HashMap<BloomMask, Vec<EntityHash>>,
    /// Memo of each type's bloom mask, learned at first attachment. Masks
    /// are stable per type, so entries are never invalidated.
    pub(crate) tmask: HashMap<ComponentTypeId, BloomMask>,
}

impl Store {
    /// An empty store owned by `context`.
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            mtable: HashMap::new(),
            ctable: HashMap::new(),
            tindex: HashMap::new(),
            nindex: HashMap::new(),
            aindex: HashMap::new(),
            tmask: HashMap::new(),
        }
    }

    /// Handle of the owning context.
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.mtable.len()
    }

    /// Whether the store holds no entities.
    pub fn is_empty(&self) -> bool {
        self.mtable.is_empty()
    }

    // -- creation and teardown ---------------------------------------------

    /// Allocate a fresh entity bound to this store's context.
    pub fn create(&mut self, opts: EntityOptions) -> Result<Entity, StoreError> {
        if let Some(name) = &opts.name {
            if self.nindex.contains_key(name) {
                return Err(StoreError::NameAlreadyRegistered { name: name.clone() });
            }
        }
        let entity = Entity::new(self.context, opts.name.clone(), opts.parent, opts.world);
        let hash = entity.hash();
        self.mtable.insert(
            hash,
            EntityRecord {
                entity: entity.clone(),
                types: BTreeSet::new(),
                metadata: Metadata::now(opts.metadata),
            },
        );
        if let Some(name) = opts.name {
            self.nindex.insert(name, hash);
        }
        self.aindex.entry(BloomMask::ZERO).or_default().push(hash);
        Ok(entity)
    }

    /// Remove the entity from every index.
    pub fn destroy(&mut self, entity: &Entity) -> Result<Vec<HookCall>, StoreError> {
        let hash = entity.hash();
        let record = self
            .mtable
            .remove(&hash)
            .ok_or(StoreError::EntityNotFound { hash })?;
        let rows = self.ctable.remove(&hash).unwrap_or_default();
        let mut hooks = Vec::with_capacity(rows.len());
        for row in &rows {
            self.remove_from_tindex(row.type_id, hash);
            hooks.push(HookCall::new(Hook::Removed, &record.entity, &row.component));
        }
        if let Some(name) = record.entity.name() {
            self.nindex.remove(name);
        }
        let mask = self.mask_for_types(&record.types);
        self.remove_from_aindex(mask, hash);
        Ok(hooks)
    }

    /// Empty every index.
    pub fn clear(&mut self) -> Vec<HookCall> {
        let mut hooks = Vec::new();
        for rows in self.ctable.values() {
            for row in rows {
                hooks.push(HookCall::new(Hook::Removed, &row.entity, &row.component));
            }
        }
        self.mtable.clear();
        self.ctable.clear();
        self.tindex.clear();
        self.nindex.clear();
        self.aindex.clear();
        self.tmask.clear();
        hooks
    }

    // -- lookups -----------------------------------------------------------

    /// The entity's record, or `None` if it does not exist.
    pub fn info(&self, entity: &Entity) -> Option<EntityRecord> {
        self.mtable.get(&entity.hash()).cloned()
    }

    /// The record of the entity registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<EntityRecord> {
        self.nindex
            .get(name)
            .and_then(|hash| self.mtable.get(hash))
            .cloned()
    }

    /// Whether the entity exists in this store.
    pub fn exists(&self, entity: &Entity) -> bool {
        self.mtable.contains_key(&entity.hash())
    }

    /// Whether an entity is registered under `name`.
    pub fn exists_named(&self, name: &str) -> bool {
        self.nindex.contains_key(name)
    }

    /// The entity and all of its components.
    pub fn fetch(&self, entity: &Entity) -> Option<(Entity, Vec<Component>)> {
        let record = self.mtable.get(&entity.hash())?;
        let components = self
            .ctable
            .get(&entity.hash())
            .map(|rows| rows.iter().map(|r| r.component.clone()).collect())
            .unwrap_or_default();
        Some((record.entity.clone(), components))
    }

    /// [`fetch`](Self::fetch) by registered name.
    pub fn fetch_named(&self, name: &str) -> Option<(Entity, Vec<Component>)> {
        let hash = self.nindex.get(name)?;
        let record = self.mtable.get(hash)?;
        let entity = record.entity.clone();
        self.fetch(&entity)
    }

    /// Entities whose parent pointer targets `entity`.
    pub fn children_of(&self, entity: &Entity) -> Vec<Entity> {
        self.mtable
            .values()
            .filter(|record| record.entity.is_child_of(entity))
            .map(|record| record.entity.clone())
            .collect()
    }

    // -- component mutations -----------------------------------------------

    /// Attach a component. At most one component per type per entity.
    pub fn emplace(&mut self, entity: &Entity, component: Component) -> Result<HookCall, StoreError> {
        let hash = entity.hash();
        let record = self
            .mtable
            .get(&hash)
            .ok_or(StoreError::EntityNotFound { hash })?;
        let type_id = component.type_id();
        if record.types.contains(&type_id) {
            return Err(StoreError::AlreadyInserted {
                hash,
                alias: component.alias().to_owned(),
            });
        }
        let canonical = record.entity.clone();
        let old_mask = self.mask_for_types(&record.types);
        let type_mask = component.mask();

        let row = ComponentRow {
            hash,
            entity: canonical.clone(),
            type_id,
            component: component.clone(),
        };
        self.ctable.entry(hash).or_default().push(row.clone());
        self.tindex.entry(type_id).or_default().push(row);
        self.tmask.insert(type_id, type_mask);
        let record = self.mtable.get_mut(&hash).expect("record present");
        record.types.insert(type_id);
        self.reindex_mask(hash, old_mask, old_mask | type_mask);
        Ok(HookCall::new(Hook::Attached, &canonical, &component))
    }

    /// Overwrite an existing component of the same type. The archetype, and
    /// therefore the mask, is unchanged.
    pub fn replace(&mut self, entity: &Entity, component: Component) -> Result<HookCall, StoreError> {
        let hash = entity.hash();
        let record = self
            .mtable
            .get(&hash)
            .ok_or(StoreError::EntityNotFound { hash })?;
        let type_id = component.type_id();
        if !record.types.contains(&type_id) {
            return Err(StoreError::ComponentNotFound { hash, type_id });
        }
        let canonical = record.entity.clone();
        if let Some(rows) = self.ctable.get_mut(&hash) {
            for row in rows.iter_mut().filter(|r| r.type_id == type_id) {
                row.component = component.clone();
            }
        }
        if let Some(rows) = self.tindex.get_mut(&type_id) {
            for row in rows.iter_mut().filter(|r| r.hash == hash) {
                row.component = component.clone();
            }
        }
        Ok(HookCall::new(Hook::Updated, &canonical, &component))
    }

    /// Detach one component (`type_id = Some`) or every component
    /// (`type_id = None`, resetting the mask to zero).
    pub fn erase(
        &mut self,
        entity: &Entity,
        type_id: Option<ComponentTypeId>,
    ) -> Result<Vec<HookCall>, StoreError> {
        let hash = entity.hash();
        let record = self
            .mtable
            .get(&hash)
            .ok_or(StoreError::EntityNotFound { hash })?;
        let canonical = record.entity.clone();
        let old_mask = self.mask_for_types(&record.types);

        match type_id {
            None => {
                let rows = self.ctable.remove(&hash).unwrap_or_default();
                let mut hooks = Vec::with_capacity(rows.len());
                for row in &rows {
                    self.remove_from_tindex(row.type_id, hash);
                    hooks.push(HookCall::new(Hook::Removed, &canonical, &row.component));
                }
                let record = self.mtable.get_mut(&hash).expect("record present");
                record.types.clear();
                self.reindex_mask(hash, old_mask, BloomMask::ZERO);
                Ok(hooks)
            }
            Some(type_id) => {
                if !record.types.contains(&type_id) {
                    return Err(StoreError::ComponentNotFound { hash, type_id });
                }
                let removed = self
                    .ctable
                    .get_mut(&hash)
                    .and_then(|rows| {
                        rows.iter()
                            .position(|r| r.type_id == type_id)
                            .map(|i| rows.remove(i))
                    })
                    .expect("ctable row present for attached type");
                self.remove_from_tindex(type_id, hash);
                let record = self.mtable.get_mut(&hash).expect("record present");
                record.types.remove(&type_id);
                let new_mask = self.mask_for_types(&self.mtable[&hash].types);
                self.reindex_mask(hash, old_mask, new_mask);
                Ok(vec![HookCall::new(Hook::Removed, &canonical, &removed.component)])
            }
        }
    }

    /// Replace the entity's component set wholesale.
    pub fn assign(
        &mut self,
        entity: &Entity,
        components: Vec<Component>,
    ) -> Result<Vec<HookCall>, StoreError> {
        let hash = entity.hash();
        let record = self
            .mtable
            .get(&hash)
            .ok_or(StoreError::EntityNotFound { hash })?;
        let canonical = record.entity.clone();
        let mut seen = BTreeSet::new();
        for component in &components {
            if !seen.insert(component.type_id()) {
                return Err(StoreError::AlreadyInserted {
                    hash,
                    alias: component.alias().to_owned(),
                });
            }
        }
        let old_mask = self.mask_for_types(&record.types);

        let mut hooks = Vec::new();
        let old_rows = self.ctable.remove(&hash).unwrap_or_default();
        for row in &old_rows {
            self.remove_from_tindex(row.type_id, hash);
            hooks.push(HookCall::new(Hook::Removed, &canonical, &row.component));
        }

        let mut new_mask = BloomMask::ZERO;
        let mut new_rows = Vec::with_capacity(components.len());
        for component in components {
            let type_id = component.type_id();
            let type_mask = component.mask();
            self.tmask.insert(type_id, type_mask);
            new_mask = new_mask | type_mask;
            let row = ComponentRow {
                hash,
                entity: canonical.clone(),
                type_id,
                component: component.clone(),
            };
            self.tindex.entry(type_id).or_default().push(row.clone());
            new_rows.push(row);
            hooks.push(HookCall::new(Hook::Attached, &canonical, &component));
        }
        if !new_rows.is_empty() {
            self.ctable.insert(hash, new_rows);
        }
        let record = self.mtable.get_mut(&hash).expect("record present");
        record.types = seen;
        self.reindex_mask(hash, old_mask, new_mask);
        Ok(hooks)
    }

    /// Replace the entity's metadata fields wholesale. `created_at` is
    /// preserved.
    pub fn patch(&mut self, entity: &Entity, fields: PropMap) -> Result<(), StoreError> {
        let hash = entity.hash();
        let record = self
            .mtable
            .get_mut(&hash)
            .ok_or(StoreError::EntityNotFound { hash })?;
        record.metadata.fields = fields;
        Ok(())
    }

    // -- mask bookkeeping --------------------------------------------------

    /// OR of the memoised per-type masks for an exact type set.
    pub(crate) fn mask_for_types(&self, types: &BTreeSet<ComponentTypeId>) -> BloomMask {
        types
            .iter()
            .map(|t| {
                *self
                    .tmask
                    .get(t)
                    .expect("attached type has a memoised mask")
            })
            .fold(BloomMask::ZERO, BloomMask::merge)
    }

    /// The mask currently stored for the entity in the archetype index.
    pub fn stored_mask(&self, entity: &Entity) -> Option<BloomMask> {
        let hash = entity.hash();
        self.aindex
            .iter()
            .find(|(_, hashes)| hashes.contains(&hash))
            .map(|(mask, _)| *mask)
    }

    /// The memoised bloom mask for a type, if it was ever attached.
    pub fn type_mask(&self, type_id: ComponentTypeId) -> Option<BloomMask> {
        self.tmask.get(&type_id).copied()
    }

    fn reindex_mask(&mut self, hash: EntityHash, old: BloomMask, new: BloomMask) {
        if old == new {
            return;
        }
        self.remove_from_aindex(old, hash);
        self.aindex.entry(new).or_default().push(hash);
    }

    fn remove_from_aindex(&mut self, mask: BloomMask, hash: EntityHash) {
        if let Some(hashes) = self.aindex.get_mut(&mask) {
            hashes.retain(|h| *h != hash);
            if hashes.is_empty() {
                self.aindex.remove(&mask);
            }
        }
    }

    fn remove_from_tindex(&mut self, type_id: ComponentTypeId, hash: EntityHash) {
        if let Some(rows) = self.tindex.get_mut(&type_id) {
            rows.retain(|r| r.hash != hash);
            if rows.is_empty() {
                self.tindex.remove(&type_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
