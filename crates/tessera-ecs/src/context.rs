//! The concurrent shell around a [`Store`].
//!
//! A [`Context`] owns one writer thread. Every mutation is shipped to it as
//! a mailbox message carrying a reply channel, so writes are serialised in
//! arrival order and each one commits all of its index updates under a
//! single write-lock acquisition.
//!
//! Reads do not go through the mailbox at all: they take the shared read
//! lock directly. A reader never waits behind queued writes, which means it
//! may observe a snapshot that is already stale -- but never one that is
//! internally inconsistent, because the writer commits whole operations.
//!
//! Lifecycle hooks collected by a mutation are handed to a dedicated hook
//! thread after the write lock is released. Hooks therefore never hold up
//! the writer or its readers, and a hook is free to call back into the
//! context -- including writes -- without deadlocking the mailbox.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::warn;

use crate::component::{Component, ComponentTypeId, PropMap};
use crate::entity::{ContextId, Entity};
use crate::store::{EntityOptions, EntityRecord, HookCall, Metadata, Store};
use crate::StoreError;

// ---------------------------------------------------------------------------
// Writer mailbox
// ---------------------------------------------------------------------------

enum WriteOp {
    Create {
        opts: EntityOptions,
        reply: Sender<Result<Entity, StoreError>>,
    },
    Emplace {
        entity: Entity,
        component: Component,
        reply: Sender<Result<(), StoreError>>,
    },
    Replace {
        entity: Entity,
        component: Component,
        reply: Sender<Result<(), StoreError>>,
    },
    Erase {
        entity: Entity,
        type_id: Option<ComponentTypeId>,
        reply: Sender<Result<(), StoreError>>,
    },
    Assign {
        entity: Entity,
        components: Vec<Component>,
        reply: Sender<Result<(), StoreError>>,
    },
    Patch {
        entity: Entity,
        fields: PropMap,
        reply: Sender<Result<(), StoreError>>,
    },
    Destroy {
        entity: Entity,
        reply: Sender<Result<(), StoreError>>,
    },
    Clear {
        reply: Sender<()>,
    },
    Execute {
        run: Box<dyn FnOnce(&mut Store) + Send>,
    },
    Shutdown,
}

fn writer_loop(shared: Arc<RwLock<Store>>, ops: Receiver<WriteOp>, hooks: Sender<HookCall>) {
    for op in ops {
        match op {
            WriteOp::Create { opts, reply } => {
                let result = shared.write().create(opts);
                let _ = reply.send(result);
            }
            WriteOp::Emplace {
                entity,
                component,
                reply,
            } => {
                let result = shared.write().emplace(&entity, component);
                finish(reply, result.map(|hook| vec![hook]), &hooks);
            }
            WriteOp::Replace {
                entity,
                component,
                reply,
            } => {
                let result = shared.write().replace(&entity, component);
                finish(reply, result.map(|hook| vec![hook]), &hooks);
            }
            WriteOp::Erase {
                entity,
                type_id,
                reply,
            } => {
                let result = shared.write().erase(&entity, type_id);
                finish(reply, result, &hooks);
            }
            WriteOp::Assign {
                entity,
                components,
                reply,
            } => {
                let result = shared.write().assign(&entity, components);
                finish(reply, result, &hooks);
            }
            WriteOp::Patch {
                entity,
                fields,
                reply,
            } => {
                let result = shared.write().patch(&entity, fields);
                let _ = reply.send(result);
            }
            WriteOp::Destroy { entity, reply } => {
                let result = shared.write().destroy(&entity);
                finish(reply, result, &hooks);
            }
            WriteOp::Clear { reply } => {
                let fired = shared.write().clear();
                let _ = reply.send(());
                for hook in fired {
                    let _ = hooks.send(hook);
                }
            }
            WriteOp::Execute { run } => {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    let mut store = shared.write();
                    run(&mut store);
                }));
                if outcome.is_err() {
                    warn!("compound write closure panicked; context writer continues");
                }
            }
            WriteOp::Shutdown => break,
        }
    }
}

/// Reply to the caller first, then queue the hooks for the hook thread.
fn finish(
    reply: Sender<Result<(), StoreError>>,
    result: Result<Vec<HookCall>, StoreError>,
    hooks: &Sender<HookCall>,
) {
    match result {
        Ok(fired) => {
            let _ = reply.send(Ok(()));
            for hook in fired {
                let _ = hooks.send(hook);
            }
        }
        Err(err) => {
            let _ = reply.send(Err(err));
        }
    }
}

/// Drain queued hook calls until every sender is gone.
fn hook_loop(hooks: Receiver<HookCall>) {
    for hook in hooks {
        if catch_unwind(AssertUnwindSafe(|| hook.fire())).is_err() {
            warn!(
                alias = hook.component.alias(),
                entity = %hook.entity.hash(),
                "component lifecycle hook panicked"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// A handle to one store and its writer thread. Cheap to clone; the writer
/// shuts down when the last handle is dropped.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: ContextId,
    shared: Arc<RwLock<Store>>,
    ops: Sender<WriteOp>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let _ = self.ops.send(WriteOp::Shutdown);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Spawn a fresh context with its own store, writer thread, and hook
    /// thread.
    pub fn new() -> Self {
        let id = ContextId::fresh();
        let shared = Arc::new(RwLock::new(Store::new(id)));
        let (ops, op_rx) = unbounded();
        let (hook_tx, hook_rx) = unbounded();
        thread::Builder::new()
            .name("context-hooks".to_owned())
            .spawn(move || hook_loop(hook_rx))
            .expect("spawn context hook thread");
        let writer_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("context-writer".to_owned())
            .spawn(move || writer_loop(writer_shared, op_rx, hook_tx))
            .expect("spawn context writer");
        Self {
            inner: Arc::new(ContextInner { id, shared, ops }),
        }
    }

    /// Handle of this context.
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    fn call<T>(&self, build: impl FnOnce(Sender<T>) -> WriteOp) -> T {
        let (reply, response) = bounded(1);
        self.inner
            .ops
            .send(build(reply))
            .expect("context writer is running");
        response.recv().expect("context writer is running")
    }

    // -- writes (serialised through the writer thread) ---------------------

    /// Allocate a fresh entity bound to this context.
    pub fn create(&self, opts: EntityOptions) -> Result<Entity, StoreError> {
        self.call(|reply| WriteOp::Create { opts, reply })
    }

    /// Attach a component to an entity.
    pub fn emplace(&self, entity: &Entity, component: Component) -> Result<(), StoreError> {
        let entity = entity.clone();
        self.call(|reply| WriteOp::Emplace {
            entity,
            component,
            reply,
        })
    }

    /// Overwrite an existing component of the same type.
    pub fn replace(&self, entity: &Entity, component: Component) -> Result<(), StoreError> {
        let entity = entity.clone();
        self.call(|reply| WriteOp::Replace {
            entity,
            component,
            reply,
        })
    }

    /// Detach one component, or all of them when `type_id` is `None`.
    pub fn erase(&self, entity: &Entity, type_id: Option<ComponentTypeId>) -> Result<(), StoreError> {
        let entity = entity.clone();
        self.call(|reply| WriteOp::Erase {
            entity,
            type_id,
            reply,
        })
    }

    /// Replace the entity's component set wholesale.
    pub fn assign(&self, entity: &Entity, components: Vec<Component>) -> Result<(), StoreError> {
        let entity = entity.clone();
        self.call(|reply| WriteOp::Assign {
            entity,
            components,
            reply,
        })
    }

    /// Replace the entity's metadata fields wholesale.
    pub fn patch(&self, entity: &Entity, fields: PropMap) -> Result<(), StoreError> {
        let entity = entity.clone();
        self.call(|reply| WriteOp::Patch {
            entity,
            fields,
            reply,
        })
    }

    /// Remove the entity from every index.
    pub fn destroy(&self, entity: &Entity) -> Result<(), StoreError> {
        let entity = entity.clone();
        self.call(|reply| WriteOp::Destroy { entity, reply })
    }

    /// Empty the context.
    pub fn clear(&self) {
        self.call(|reply| WriteOp::Clear { reply })
    }

    /// Run a closure on the writer thread with exclusive store access.
    ///
    /// This is the escape hatch for compound writes that must commit
    /// atomically with respect to every other mutation and reader.
    ///
    /// # Panics
    ///
    /// Panics if the closure panics; the writer itself survives.
    pub fn execute<R, F>(&self, run: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut Store) -> R + Send + 'static,
    {
        let (reply, response) = bounded(1);
        self.inner
            .ops
            .send(WriteOp::Execute {
                run: Box::new(move |store| {
                    let _ = reply.send(run(store));
                }),
            })
            .expect("context writer is running");
        response
            .recv()
            .expect("compound write completed on the context writer")
    }

    // -- reads (dirty: straight to the tables) -----------------------------

    /// The entity's record, or `None`.
    pub fn info(&self, entity: &Entity) -> Option<EntityRecord> {
        self.inner.shared.read().info(entity)
    }

    /// The record of the entity registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<EntityRecord> {
        self.inner.shared.read().lookup(name)
    }

    /// Whether the entity exists.
    pub fn exists(&self, entity: &Entity) -> bool {
        self.inner.shared.read().exists(entity)
    }

    /// Whether an entity is registered under `name`.
    pub fn exists_named(&self, name: &str) -> bool {
        self.inner.shared.read().exists_named(name)
    }

    /// The entity and all of its components.
    pub fn fetch(&self, entity: &Entity) -> Option<(Entity, Vec<Component>)> {
        self.inner.shared.read().fetch(entity)
    }

    /// [`fetch`](Self::fetch) by registered name.
    pub fn fetch_named(&self, name: &str) -> Option<(Entity, Vec<Component>)> {
        self.inner.shared.read().fetch_named(name)
    }

    /// Entities cloned (directly) from `entity`.
    pub fn children_of(&self, entity: &Entity) -> Vec<Entity> {
        self.inner.shared.read().children_of(entity)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.inner.shared.read().len()
    }

    /// Whether the context holds no entities.
    pub fn is_empty(&self) -> bool {
        self.inner.shared.read().is_empty()
    }

    /// Every `(entity, component)` pair of one type.
    pub fn all(&self, type_id: ComponentTypeId) -> Vec<(Entity, Component)> {
        self.inner.shared.read().all(type_id)
    }

    /// The entity's component of one type.
    pub fn get(&self, entity: &Entity, type_id: ComponentTypeId) -> Option<Component> {
        self.inner.shared.read().get(entity, type_id)
    }

    /// [`get`](Self::get) with a caller-supplied default.
    pub fn get_or(&self, entity: &Entity, type_id: ComponentTypeId, default: Component) -> Component {
        self.inner.shared.read().get_or(entity, type_id, default)
    }

    /// Exact property match over one type's rows.
    pub fn match_props(&self, type_id: ComponentTypeId, props: &PropMap) -> Vec<(Entity, Component)> {
        self.inner.shared.read().match_props(type_id, props)
    }

    /// Numeric `>=` filter over one type's rows.
    pub fn at_least(&self, type_id: ComponentTypeId, prop: &str, value: f64) -> Vec<(Entity, Component)> {
        self.inner.shared.read().at_least(type_id, prop, value)
    }

    /// Numeric `<=` filter over one type's rows.
    pub fn at_most(&self, type_id: ComponentTypeId, prop: &str, value: f64) -> Vec<(Entity, Component)> {
        self.inner.shared.read().at_most(type_id, prop, value)
    }

    /// Numeric interval filter over one type's rows.
    pub fn between(
        &self,
        type_id: ComponentTypeId,
        prop: &str,
        lo: f64,
        hi: f64,
    ) -> Vec<(Entity, Component)> {
        self.inner.shared.read().between(type_id, prop, lo, hi)
    }

    /// Entities carrying every listed type.
    pub fn all_of(&self, types: &[ComponentTypeId]) -> Vec<Entity> {
        self.inner.shared.read().all_of(types)
    }

    /// Entities carrying at least one listed type.
    pub fn any_of(&self, types: &[ComponentTypeId]) -> Vec<Entity> {
        self.inner.shared.read().any_of(types)
    }

    /// Entities carrying none of the listed types.
    pub fn none_of(&self, types: &[ComponentTypeId]) -> Vec<Entity> {
        self.inner.shared.read().none_of(types)
    }

    /// Combined archetype search.
    pub fn search(
        &self,
        all: &[ComponentTypeId],
        any: &[ComponentTypeId],
        none: &[ComponentTypeId],
    ) -> Vec<Entity> {
        self.inner.shared.read().search(all, any, none)
    }

    /// Snapshot of every entity's metadata.
    pub fn metadata(&self) -> Vec<(Entity, Metadata)> {
        self.inner.shared.read().metadata()
    }

    /// Snapshot of every component attachment.
    pub fn components(&self) -> Vec<(Entity, Component)> {
        self.inner.shared.read().components()
    }

    /// Snapshot of every entity joined with its component list.
    pub fn entities(&self) -> Vec<(Entity, Vec<Component>)> {
        self.inner.shared.read().entities()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("entities", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
