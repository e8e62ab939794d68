//! Queries over the store's indexes.
//!
//! Typed range queries scan only the `tindex` rows of one component type.
//! Set-composition queries go through the archetype index: bloom masks
//! discard most non-matches cheaply, then survivors are re-verified against
//! the exact type sets, since bloom filters admit false positives but never
//! false negatives.
//!
//! The streaming accessors return owned snapshots. The concurrent shell
//! takes its read guard for the duration of the snapshot, which is the
//! fix/release contract: the tables cannot shift underneath an iteration,
//! and the guard is released on every exit path.

use std::collections::HashMap;

use serde_json::Value;

use crate::bloom::BloomMask;
use crate::component::{Component, ComponentTypeId, PropMap};
use crate::entity::{Entity, EntityHash};
use crate::store::{Metadata, Store};

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

impl Store {
    // -- typed range queries -----------------------------------------------

    /// Every `(entity, component)` pair of the given type.
    pub fn all(&self, type_id: ComponentTypeId) -> Vec<(Entity, Component)> {
        self.tindex
            .get(&type_id)
            .map(|rows| {
                rows.iter()
                    .map(|r| (r.entity.clone(), r.component.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The entity's component of the given type, if attached.
    pub fn get(&self, entity: &Entity, type_id: ComponentTypeId) -> Option<Component> {
        let hash = entity.hash();
        self.tindex.get(&type_id).and_then(|rows| {
            rows.iter()
                .find(|r| r.hash == hash)
                .map(|r| r.component.clone())
        })
    }

    /// [`get`](Self::get) with a caller-supplied default.
    pub fn get_or(&self, entity: &Entity, type_id: ComponentTypeId, default: Component) -> Component {
        self.get(entity, type_id).unwrap_or(default)
    }

    /// Rows of the given type whose component matches every property in
    /// `props` exactly.
    ///
    /// # Panics
    ///
    /// Panics if `props` is empty; an unconstrained match is a caller bug.
    pub fn match_props(&self, type_id: ComponentTypeId, props: &PropMap) -> Vec<(Entity, Component)> {
        assert!(
            !props.is_empty(),
            "match requires at least one property to match on"
        );
        self.filter_rows(type_id, |component| {
            props
                .iter()
                .all(|(key, value)| component.get(key) == Some(value))
        })
    }

    /// Rows whose numeric property `prop` is `>= value`.
    pub fn at_least(
        &self,
        type_id: ComponentTypeId,
        prop: &str,
        value: f64,
    ) -> Vec<(Entity, Component)> {
        self.filter_rows(type_id, |component| {
            component.get(prop).and_then(as_number).is_some_and(|n| n >= value)
        })
    }

    /// Rows whose numeric property `prop` is `<= value`.
    pub fn at_most(
        &self,
        type_id: ComponentTypeId,
        prop: &str,
        value: f64,
    ) -> Vec<(Entity, Component)> {
        self.filter_rows(type_id, |component| {
            component.get(prop).and_then(as_number).is_some_and(|n| n <= value)
        })
    }

    /// Rows whose numeric property `prop` lies in `[lo, hi]`.
    ///
    /// # Panics
    ///
    /// Panics if `lo > hi`.
    pub fn between(
        &self,
        type_id: ComponentTypeId,
        prop: &str,
        lo: f64,
        hi: f64,
    ) -> Vec<(Entity, Component)> {
        assert!(lo <= hi, "between requires lo <= hi, got {lo} > {hi}");
        self.filter_rows(type_id, |component| {
            component
                .get(prop)
                .and_then(as_number)
                .is_some_and(|n| lo <= n && n <= hi)
        })
    }

    fn filter_rows<F>(&self, type_id: ComponentTypeId, keep: F) -> Vec<(Entity, Component)>
    where
        F: Fn(&Component) -> bool,
    {
        self.tindex
            .get(&type_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| keep(&r.component))
                    .map(|r| (r.entity.clone(), r.component.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // -- set-composition queries -------------------------------------------

    /// Entities carrying every listed type.
    pub fn all_of(&self, types: &[ComponentTypeId]) -> Vec<Entity> {
        self.search(types, &[], &[])
    }

    /// Entities carrying at least one listed type.
    pub fn any_of(&self, types: &[ComponentTypeId]) -> Vec<Entity> {
        self.search(&[], types, &[])
    }

    /// Entities carrying none of the listed types.
    pub fn none_of(&self, types: &[ComponentTypeId]) -> Vec<Entity> {
        self.search(&[], &[], types)
    }

    /// Archetype search combining `all` / `any` / `none` constraints. An
    /// empty slice means "no constraint of that kind".
    pub fn search(
        &self,
        all: &[ComponentTypeId],
        any: &[ComponentTypeId],
        none: &[ComponentTypeId],
    ) -> Vec<Entity> {
        // A required type that was never attached anywhere cannot be
        // satisfied; an `any` list of only such types cannot either.
        let mut all_mask = BloomMask::ZERO;
        for type_id in all {
            match self.type_mask(*type_id) {
                Some(mask) => all_mask = all_mask | mask,
                None => return Vec::new(),
            }
        }
        let any_masks: Vec<BloomMask> = any
            .iter()
            .filter_map(|type_id| self.type_mask(*type_id))
            .collect();
        if !any.is_empty() && any_masks.is_empty() {
            return Vec::new();
        }
        let any_mask = any_masks
            .iter()
            .copied()
            .fold(BloomMask::ZERO, BloomMask::merge);
        let none_mask = none
            .iter()
            .filter_map(|type_id| self.type_mask(*type_id))
            .fold(BloomMask::ZERO, BloomMask::merge);

        let mut out = Vec::new();
        for (mask, hashes) in &self.aindex {
            if !mask.contains(&all_mask) {
                continue;
            }
            if !any.is_empty() && !mask.intersects(&any_mask) {
                continue;
            }
            if mask.intersects(&none_mask) {
                continue;
            }
            for hash in hashes {
                let record = match self.mtable.get(hash) {
                    Some(record) => record,
                    None => continue,
                };
                // Bloom survivors may be false positives; re-check the
                // exact type set. `none` needs no re-check: a hit in the
                // mask can only overreport, and overreporting `none`
                // excludes, never includes.
                if !all.iter().all(|t| record.types.contains(t)) {
                    continue;
                }
                if !any.is_empty() && !any.iter().any(|t| record.types.contains(t)) {
                    continue;
                }
                out.push(record.entity.clone());
            }
        }
        out
    }

    // -- streams -----------------------------------------------------------

    /// Snapshot of every entity's metadata.
    pub fn metadata(&self) -> Vec<(Entity, Metadata)> {
        self.mtable
            .values()
            .map(|record| (record.entity.clone(), record.metadata.clone()))
            .collect()
    }

    /// Snapshot of every component attachment.
    pub fn components(&self) -> Vec<(Entity, Component)> {
        self.ctable
            .values()
            .flat_map(|rows| {
                rows.iter()
                    .map(|r| (r.entity.clone(), r.component.clone()))
            })
            .collect()
    }

    /// Snapshot of every entity joined with its full component list.
    ///
    /// Implemented as an iterative join over the concatenation of the
    /// entity rows and the component rows: each entity accumulates until
    /// the observed component count reaches its expected archetype size,
    /// at which point the tuple is emitted.
    pub fn entities(&self) -> Vec<(Entity, Vec<Component>)> {
        struct JoinState {
            entity: Option<Entity>,
            expected: Option<usize>,
            collected: Vec<Component>,
        }

        enum JoinRow {
            Meta(EntityHash, Entity, usize),
            Comp(EntityHash, Component),
        }

        let rows = self
            .mtable
            .values()
            .map(|record| JoinRow::Meta(record.entity.hash(), record.entity.clone(), record.types.len()))
            .chain(self.ctable.values().flat_map(|rows| {
                rows.iter()
                    .map(|r| JoinRow::Comp(r.hash, r.component.clone()))
            }));

        let mut pending: HashMap<EntityHash, JoinState> = HashMap::new();
        let mut out = Vec::new();
        for row in rows {
            let hash = match &row {
                JoinRow::Meta(hash, ..) | JoinRow::Comp(hash, _) => *hash,
            };
            let state = pending.entry(hash).or_insert_with(|| JoinState {
                entity: None,
                expected: None,
                collected: Vec::new(),
            });
            match row {
                JoinRow::Meta(_, entity, expected) => {
                    state.entity = Some(entity);
                    state.expected = Some(expected);
                }
                JoinRow::Comp(_, component) => state.collected.push(component),
            }
            if state.entity.is_some() && state.expected == Some(state.collected.len()) {
                let state = pending.remove(&hash).expect("join state present");
                out.push((state.entity.expect("entity observed"), state.collected));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentType;
    use crate::entity::ContextId;
    use crate::event::EventName;
    use serde_json::json;
    use std::sync::Arc;

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

    fn component(id: u32, alias: &'static str, props: serde_json::Value) -> Component {
        let kind = Arc::new(Kind { alias });
        let props = kind.cast(&props);
        Component::new(ComponentTypeId::from_raw(id), kind, props)
    }

    const HEALTH: ComponentTypeId = ComponentTypeId::from_raw(0);
    const POSITION: ComponentTypeId = ComponentTypeId::from_raw(1);
    const MANA: ComponentTypeId = ComponentTypeId::from_raw(2);

    fn store_with_entities() -> (Store, Entity, Entity, Entity) {
        let mut s = Store::new(ContextId::fresh());
        // e1 has {health, position, mana}, e2 has {health, position},
        // e3 has {health, mana}.
        let e1 = s.create(Default::default()).unwrap();
        let e2 = s.create(Default::default()).unwrap();
        let e3 = s.create(Default::default()).unwrap();
        s.emplace(&e1, component(0, "health", json!({"current": 100})))
            .unwrap();
        s.emplace(&e1, component(1, "position", json!({"x": 1, "y": 2})))
            .unwrap();
        s.emplace(&e1, component(2, "mana", json!({"current": 40})))
            .unwrap();
        s.emplace(&e2, component(0, "health", json!({"current": 60})))
            .unwrap();
        s.emplace(&e2, component(1, "position", json!({"x": 3, "y": 4})))
            .unwrap();
        s.emplace(&e3, component(0, "health", json!({"current": 20})))
            .unwrap();
        s.emplace(&e3, component(2, "mana", json!({"current": 10})))
            .unwrap();
        (s, e1, e2, e3)
    }

    #[test]
    fn all_scans_one_type() {
        let (s, ..) = store_with_entities();
        assert_eq!(s.all(HEALTH).len(), 3);
        assert_eq!(s.all(POSITION).len(), 2);
        assert_eq!(s.all(ComponentTypeId::from_raw(9)).len(), 0);
    }

    #[test]
    fn get_and_get_or() {
        let (s, e1, _, e3) = store_with_entities();
        assert_eq!(
            s.get(&e1, POSITION).unwrap().get("x"),
            Some(&json!(1))
        );
        assert!(s.get(&e3, POSITION).is_none());
        let fallback = component(1, "position", json!({"x": 0, "y": 0}));
        assert_eq!(
            s.get_or(&e3, POSITION, fallback.clone()).get("x"),
            Some(&json!(0))
        );
        assert_eq!(s.get_or(&e1, POSITION, fallback).get("x"), Some(&json!(1)));
    }

    #[test]
    fn match_props_compares_exact_values() {
        let (s, _, e2, _) = store_with_entities();
        let mut props = PropMap::new();
        props.insert("x".to_owned(), json!(3));
        props.insert("y".to_owned(), json!(4));
        let hits = s.match_props(POSITION, &props);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, e2);
    }

    #[test]
    #[should_panic(expected = "at least one property")]
    fn match_props_rejects_empty() {
        let (s, ..) = store_with_entities();
        s.match_props(POSITION, &PropMap::new());
    }

    #[test]
    fn numeric_range_queries() {
        let (s, e1, e2, e3) = store_with_entities();
        let hits = s.at_least(HEALTH, "current", 60.0);
        let entities: Vec<&Entity> = hits.iter().map(|(e, _)| e).collect();
        assert_eq!(hits.len(), 2);
        assert!(entities.contains(&&e1) && entities.contains(&&e2));

        let hits = s.at_most(HEALTH, "current", 20.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, e3);

        let hits = s.between(HEALTH, "current", 30.0, 80.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, e2);
    }

    #[test]
    fn range_queries_skip_non_numeric_properties() {
        let mut s = Store::new(ContextId::fresh());
        let e = s.create(Default::default()).unwrap();
        s.emplace(&e, component(0, "health", json!({"current": "full"})))
            .unwrap();
        assert!(s.at_least(HEALTH, "current", 0.0).is_empty());
        assert!(s.at_most(HEALTH, "missing", 0.0).is_empty());
    }

    #[test]
    #[should_panic(expected = "lo <= hi")]
    fn between_rejects_inverted_bounds() {
        let (s, ..) = store_with_entities();
        s.between(HEALTH, "current", 10.0, 5.0);
    }

    #[test]
    fn search_combines_all_any_none() {
        let (s, _, _, e3) = store_with_entities();
        // all [health], any [mana], none [position] selects exactly e3.
        let hits = s.search(&[HEALTH], &[MANA], &[POSITION]);
        assert_eq!(hits, vec![e3]);
    }

    #[test]
    fn all_of_requires_every_type() {
        let (s, e1, e2, e3) = store_with_entities();
        let mut hits = s.all_of(&[HEALTH, POSITION]);
        hits.sort_by_key(Entity::hash);
        let mut expected = vec![e1, e2];
        expected.sort_by_key(Entity::hash);
        assert_eq!(hits, expected);
        assert_eq!(s.all_of(&[HEALTH]).len(), 3);
        let _ = e3;
    }

    #[test]
    fn any_of_and_none_of() {
        let (s, e1, e2, e3) = store_with_entities();
        let mut hits = s.any_of(&[MANA]);
        hits.sort_by_key(Entity::hash);
        let mut expected = vec![e1, e3];
        expected.sort_by_key(Entity::hash);
        assert_eq!(hits, expected);

        let hits = s.none_of(&[MANA]);
        assert_eq!(hits, vec![e2]);
    }

    #[test]
    fn unseen_types_constrain_correctly() {
        let (s, ..) = store_with_entities();
        let unseen = ComponentTypeId::from_raw(42);
        // Required-but-never-attached cannot match.
        assert!(s.all_of(&[HEALTH, unseen]).is_empty());
        assert!(s.any_of(&[unseen]).is_empty());
        // None-of an unseen type excludes nothing.
        assert_eq!(s.none_of(&[unseen]).len(), 3);
    }

    #[test]
    fn empty_archetypes_survive_none_queries() {
        let mut s = Store::new(ContextId::fresh());
        let bare = s.create(Default::default()).unwrap();
        assert_eq!(s.none_of(&[HEALTH]), vec![bare.clone()]);
        assert!(s.all_of(&[]).contains(&bare));
    }

    #[test]
    fn metadata_stream_covers_every_entity() {
        let (s, ..) = store_with_entities();
        assert_eq!(s.metadata().len(), 3);
    }

    #[test]
    fn components_stream_covers_every_row() {
        let (s, ..) = store_with_entities();
        assert_eq!(s.components().len(), 7);
    }

    #[test]
    fn entities_stream_joins_components_per_entity() {
        let (s, e1, _, e3) = store_with_entities();
        let joined = s.entities();
        assert_eq!(joined.len(), 3);
        let row = joined.iter().find(|(e, _)| *e == e1).unwrap();
        assert_eq!(row.1.len(), 3);
        let row = joined.iter().find(|(e, _)| *e == e3).unwrap();
        assert_eq!(row.1.len(), 2);
    }

    #[test]
    fn entities_stream_emits_component_free_entities() {
        let mut s = Store::new(ContextId::fresh());
        let bare = s.create(Default::default()).unwrap();
        let joined = s.entities();
        assert_eq!(joined, vec![(bare, vec![])]);
    }
}
