//! Component values and the component capability contract.
//!
//! A *component type* is an external definition: it owns an alias, a declared
//! event list, and the property validation rules. The storage core only sees
//! the [`ComponentType`] capability surface plus plain property-map data.
//! A *component* is one validated property map attached to one entity; an
//! entity carries at most one component per type.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bloom::BloomMask;
use crate::entity::Entity;
use crate::event::{Event, EventName, Flow};

/// Property maps. Components and event args share this representation.
pub type PropMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
///
/// Identifiers are assigned at registration time and are the key used by the
/// store's indexes and by event handler lists.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentTypeId(u32);

impl ComponentTypeId {
    /// Construct from a raw registration index.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw `u32` representation.
    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Hook
// ---------------------------------------------------------------------------

/// Lifecycle hook fired out-of-band after a successful mutation of one
/// component type on one entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    /// The component was inserted on the entity.
    Attached,
    /// The component's value was overwritten in place.
    Updated,
    /// The component was removed from the entity.
    Removed,
}

// ---------------------------------------------------------------------------
// ComponentType
// ---------------------------------------------------------------------------

/// The capability contract an external component definition provides.
///
/// Property validation (types, ranges, enumerations) is specified by the
/// definition layer, not by this core; `cast` is where it happens. The
/// default `cast` accepts any JSON object as-is.
pub trait ComponentType: Send + Sync {
    /// Stable alias: a lower-case identifier used as the external key for
    /// overrides, prefab declarations, and the registry catalogue.
    fn name(&self) -> &str;

    /// The finite list of event names this type handles, in declaration
    /// order. Together with the alias this is the type's bloom identity.
    fn events(&self) -> Vec<EventName>;

    /// Normalise raw input into a validated property map.
    ///
    /// # Panics
    ///
    /// Panics if `props` is not a JSON object. A non-map property payload is
    /// a caller bug, not a recoverable condition.
    fn cast(&self, props: &Value) -> PropMap {
        match props {
            Value::Object(map) => map.clone(),
            other => panic!(
                "component '{}': properties must be a map, got {other}",
                self.name()
            ),
        }
    }

    /// React to an event dispatched to an entity carrying this type.
    ///
    /// `None` means the type does not export a handler; the dispatcher
    /// substitutes `(Flow::Continue, event)`. A returned event must differ
    /// from the input only in its `args`.
    #[allow(unused_variables)]
    fn handle_event(&self, name: &str, event: Event) -> Option<(Flow, Event)> {
        None
    }

    /// Out-of-band lifecycle notification, called after the mutation that
    /// attached, updated, or removed this type on `entity` has committed.
    #[allow(unused_variables)]
    fn on_hook(&self, hook: Hook, entity: &Entity, component: &Component) {}
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// A typed property map attached to an entity.
#[derive(Clone)]
pub struct Component {
    type_id: ComponentTypeId,
    kind: Arc<dyn ComponentType>,
    props: PropMap,
}

impl Component {
    /// Build a component value from an already-validated property map.
    pub fn new(type_id: ComponentTypeId, kind: Arc<dyn ComponentType>, props: PropMap) -> Self {
        Self {
            type_id,
            kind,
            props,
        }
    }

    /// The registered type identifier.
    pub fn type_id(&self) -> ComponentTypeId {
        self.type_id
    }

    /// The type's registered alias.
    pub fn alias(&self) -> &str {
        self.kind.name()
    }

    /// The type's declared event list.
    pub fn events(&self) -> Vec<EventName> {
        self.kind.events()
    }

    /// The capability handle for this component's type.
    pub fn kind(&self) -> &Arc<dyn ComponentType> {
        &self.kind
    }

    /// The validated property map.
    pub fn props(&self) -> &PropMap {
        &self.props
    }

    /// Consume the component, yielding its property map.
    pub fn into_props(self) -> PropMap {
        self.props
    }

    /// Single property lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Bloom mask of this component's type.
    pub fn mask(&self) -> BloomMask {
        BloomMask::for_type(self.kind.name(), &self.kind.events())
    }

    /// A copy of this component with `overrides` merged over its properties.
    ///
    /// The merge is one level deep: each override value replaces the whole
    /// property under its key.
    pub fn merge_props(&self, overrides: PropMap) -> Component {
        let mut props = self.props.clone();
        for (key, value) in overrides {
            props.insert(key, value);
        }
        Component::new(self.type_id, Arc::clone(&self.kind), props)
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.props == other.props
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("alias", &self.alias())
            .field("type_id", &self.type_id)
            .field("props", &self.props)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
