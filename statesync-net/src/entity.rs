//! Entities: schema-shaped state wired to audience groups.
//!
//! Spawning an entity resolves its schema's symbolic roles against the
//! concrete instance (owner, channel members, named groups), then wires the
//! state tree's events into those groups:
//!
//! ```text
//!                    ┌── Write(key, old≠new) ──▶ output group .read(..)
//! WatchedObject ─────┤
//!                    └── Call(method, ..) ─────▶ event group .listen(..)
//! ```
//!
//! Deleting an entity is terminal: it detaches from its channel and owner,
//! disables its computed properties and silences its state. Every mutating
//! operation on a deleted entity is a silent no-op.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use statesync_core::computed::ComputedProperty;
use statesync_core::scheduler::Scheduler;
use statesync_core::watched::{Value, WatchEvent, WatchedObject};
use uuid::Uuid;

use crate::channel::{Channel, WeakChannel};
use crate::schema::{DeleteHook, GroupRole, MethodHandler, SchemaError, SchemaRegistry};
use crate::user::User;
use crate::usergroup::{MethodCall, StateChange, UserGroup};

struct PropertyPolicy {
    input: UserGroup,
    output: UserGroup,
    public: String,
}

struct MethodEntry {
    call: UserGroup,
    event: UserGroup,
    handler: MethodHandler,
    public: String,
}

struct EntityInner {
    id: String,
    type_name: String,
    path: String,
    channel: WeakChannel,
    owner: Option<User>,
    state: WatchedObject,
    /// Keyed by internal root property name.
    policy: HashMap<String, PropertyPolicy>,
    /// Public name → internal name, for wire-side lookups.
    internal_names: HashMap<String, String>,
    /// Keyed by internal method name.
    methods: HashMap<String, MethodEntry>,
    method_names: HashMap<String, String>,
    computed: Vec<ComputedProperty>,
    delete_hooks: Vec<DeleteHook>,
    deleted: bool,
}

/// Cloneable handle to one live entity.
pub struct Entity {
    inner: Rc<RefCell<EntityInner>>,
}

impl Clone for Entity {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Entity {
    /// Spawn an entity of a registered type into `channel`.
    ///
    /// Freezes the registry. `groups` must supply every named group the
    /// schema declares. The entity's full visible state is queued for the
    /// next view frame of each audience.
    pub fn spawn(
        registry: &SchemaRegistry,
        scheduler: &Scheduler,
        channel: &Channel,
        owner: Option<&User>,
        type_name: &str,
        initial: Value,
        groups: HashMap<String, UserGroup>,
    ) -> Result<Entity, SchemaError> {
        registry.freeze();
        let schema = registry.get(type_name)?;

        for group in schema.groups() {
            if !groups.contains_key(group) {
                return Err(SchemaError::MissingGroup {
                    schema: type_name.to_string(),
                    group: group.clone(),
                });
            }
        }

        // One audience per role, shared across every key that resolves to
        // it, so a tick's worth of changes flushes as one view frame.
        let owners = match owner {
            Some(user) => UserGroup::of_user(scheduler, user),
            None => UserGroup::none(scheduler),
        };
        let nobody = UserGroup::none(scheduler);
        let resolve = |role: &GroupRole| -> UserGroup {
            match role {
                GroupRole::Owners => owners.clone(),
                GroupRole::Viewers => channel.users(),
                GroupRole::Nobody => nobody.clone(),
                // Validated against the declared list above.
                GroupRole::Named(name) => groups[name].clone(),
            }
        };

        let id = Uuid::new_v4().to_string();
        let path = format!("{}/{}/{}/{}", channel.kind(), channel.id(), type_name, id);
        let state = WatchedObject::new(initial, &[]);

        let mut policy = HashMap::new();
        let mut internal_names = HashMap::new();
        for spec in schema.properties() {
            policy.insert(
                spec.name.clone(),
                PropertyPolicy {
                    input: resolve(&spec.input),
                    output: resolve(&spec.output),
                    public: spec.public_name().to_string(),
                },
            );
            internal_names.insert(spec.public_name().to_string(), spec.name.clone());
        }

        let mut methods = HashMap::new();
        let mut method_names = HashMap::new();
        for spec in schema.methods() {
            methods.insert(
                spec.name.clone(),
                MethodEntry {
                    call: resolve(&spec.call),
                    event: resolve(&spec.event),
                    handler: Rc::clone(&spec.handler),
                    public: spec.public_name().to_string(),
                },
            );
            method_names.insert(spec.public_name().to_string(), spec.name.clone());
        }

        let entity = Entity {
            inner: Rc::new(RefCell::new(EntityInner {
                id,
                type_name: type_name.to_string(),
                path,
                channel: channel.downgrade(),
                owner: owner.cloned(),
                state: state.clone(),
                policy,
                internal_names,
                methods,
                method_names,
                computed: Vec::new(),
                delete_hooks: schema.delete_hooks().to_vec(),
                deleted: false,
            })),
        };

        let weak = Rc::downgrade(&entity.inner);
        state.on(move |event| Self::relay(&weak, event));

        // Computed getters come online after the relay so their synthetic
        // writes broadcast like any other change.
        let mut computed = Vec::new();
        for spec in schema.properties() {
            if let Some(getter) = &spec.getter {
                let getter = Rc::clone(getter);
                computed.push(ComputedProperty::infer_pinned(
                    &state,
                    &spec.name,
                    scheduler,
                    &spec.pinned,
                    move |reference| getter(reference),
                ));
            }
        }
        entity.inner.borrow_mut().computed = computed;

        channel.register_entity(&entity);
        if let Some(user) = owner {
            user.register_owned(&entity);
        }

        entity.queue_full_view();
        log::debug!("spawned {}", entity.path());
        Ok(entity)
    }

    /// Route one state event to the audience its policy names.
    fn relay(weak: &Weak<RefCell<EntityInner>>, event: &WatchEvent) {
        let Some(inner) = weak.upgrade() else { return };
        let entity = Entity { inner };

        match event {
            WatchEvent::Write {
                key,
                old_value,
                new_value,
            } => {
                if old_value == new_value {
                    return;
                }
                let Some((group, public_key)) = entity.output_route(key) else {
                    return;
                };
                group.read(StateChange {
                    entity,
                    key: public_key,
                    value: new_value.clone(),
                });
            }
            WatchEvent::Delete { key, .. } => {
                let Some((group, public_key)) = entity.output_route(key) else {
                    return;
                };
                group.read(StateChange {
                    entity,
                    key: public_key,
                    value: Value::Null,
                });
            }
            WatchEvent::Call {
                key,
                parameters,
                returned_value,
            } => {
                let (group, public) = {
                    let inner = entity.inner.borrow();
                    if inner.deleted {
                        return;
                    }
                    let Some(entry) = inner.methods.get(key) else {
                        return;
                    };
                    (entry.event.clone(), entry.public.clone())
                };
                group.listen(&MethodCall {
                    entity,
                    method: public,
                    parameters: parameters.clone(),
                    returned_value: returned_value.clone(),
                });
            }
            WatchEvent::Read { .. } => {}
        }
    }

    /// Output group and public key for an internal (possibly dotted) key.
    /// `None` for undeclared properties and deleted entities.
    fn output_route(&self, key: &str) -> Option<(UserGroup, String)> {
        let inner = self.inner.borrow();
        if inner.deleted {
            return None;
        }
        let (root, rest) = split_root(key);
        let entry = inner.policy.get(root)?;
        let public_key = match rest {
            Some(rest) => format!("{}.{rest}", entry.public),
            None => entry.public.clone(),
        };
        Some((entry.output.clone(), public_key))
    }

    /// Queue the entity's current visible state, one change per declared
    /// property, so new audiences receive a full snapshot next tick.
    fn queue_full_view(&self) {
        let snapshot = {
            let inner = self.inner.borrow();
            inner.state.snapshot()
        };
        let routes: Vec<(UserGroup, String, Value)> = {
            let inner = self.inner.borrow();
            inner
                .policy
                .iter()
                .filter_map(|(name, entry)| {
                    let value = match snapshot.get(name) {
                        Some(value) => value.clone(),
                        None => inner
                            .computed
                            .iter()
                            .find(|c| c.key() == *name)?
                            .value(),
                    };
                    Some((entry.output.clone(), entry.public.clone(), value))
                })
                .collect()
        };
        for (group, key, value) in routes {
            group.read(StateChange {
                entity: self.clone(),
                key,
                value,
            });
        }
    }

    /// Send this entity's current state visible to `user` directly, outside
    /// the debounced path. Used to catch a user up when they join a channel
    /// with entities already in it.
    pub(crate) fn send_view_to(&self, user: &User) {
        let (path, diff) = {
            let inner = self.inner.borrow();
            if inner.deleted {
                return;
            }
            let snapshot = inner.state.snapshot();
            let mut diff = serde_json::Map::new();
            for (name, entry) in &inner.policy {
                if !entry.output.contains(user) {
                    continue;
                }
                let value = match snapshot.get(name) {
                    Some(value) => value.clone(),
                    None => match inner.computed.iter().find(|c| c.key() == *name) {
                        Some(property) => property.value(),
                        None => continue,
                    },
                };
                diff.insert(entry.public.clone(), value);
            }
            (inner.path.clone(), diff)
        };
        if diff.is_empty() {
            return;
        }
        user.send(crate::protocol::OutputBody::View {
            changes: vec![crate::protocol::ViewChange { path, diff }],
        });
    }

    pub fn id(&self) -> String {
        self.inner.borrow().id.clone()
    }

    pub fn type_name(&self) -> String {
        self.inner.borrow().type_name.clone()
    }

    /// `ChannelKind/channel_id/Type/entity_id`.
    pub fn path(&self) -> String {
        self.inner.borrow().path.clone()
    }

    pub fn channel(&self) -> Option<Channel> {
        self.inner.borrow().channel.upgrade()
    }

    pub fn owner(&self) -> Option<User> {
        self.inner.borrow().owner.clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.borrow().deleted
    }

    /// Direct handle to the backing state, for host-side logic and method
    /// handlers.
    pub fn state(&self) -> WatchedObject {
        self.inner.borrow().state.clone()
    }

    /// Read an internal (possibly dotted) key.
    pub fn get(&self, key: &str) -> Value {
        let state = self.state();
        let (node, leaf) = match descend(&state, key) {
            Some(found) => found,
            None => return Value::Null,
        };
        node.get(&leaf)
    }

    /// Write an internal (possibly dotted) key. Silent no-op when the entity
    /// is deleted or an intermediate node is missing.
    pub fn set(&self, key: &str, value: Value) {
        if self.is_deleted() {
            log::trace!("write to deleted entity {} ignored", self.path());
            return;
        }
        let state = self.state();
        if let Some((node, leaf)) = descend(&state, key) {
            node.set(&leaf, value);
        } else {
            log::trace!("write to missing path {key} on {} ignored", self.path());
        }
    }

    /// Invoke a method by internal name, as the host or on behalf of a user.
    /// `None` when the entity is deleted or the method does not exist.
    pub fn invoke(&self, method: &str, caller: Option<&User>, parameters: &[Value]) -> Option<Value> {
        let (handler, state) = {
            let inner = self.inner.borrow();
            if inner.deleted {
                return None;
            }
            let entry = inner.methods.get(method)?;
            (Rc::clone(&entry.handler), inner.state.clone())
        };
        let returned = handler(self, caller, parameters);
        state.report_call(method, parameters, returned.clone());
        Some(returned)
    }

    /// Apply a wire write. Returns whether it was applied; unauthorized and
    /// undeclared keys are dropped silently.
    pub fn write_from(&self, user: &User, public_key: &str, value: Value) -> bool {
        let internal_key = {
            let inner = self.inner.borrow();
            if inner.deleted {
                return false;
            }
            let (root, rest) = split_root(public_key);
            let Some(internal_root) = inner.internal_names.get(root) else {
                log::trace!("write to undeclared key {public_key} dropped");
                return false;
            };
            let entry = &inner.policy[internal_root];
            if !entry.input.contains(user) {
                log::trace!(
                    "unauthorized write to {} by user {} dropped",
                    public_key,
                    user.id()
                );
                return false;
            }
            match rest {
                Some(rest) => format!("{internal_root}.{rest}"),
                None => internal_root.clone(),
            }
        };
        self.set(&internal_key, value);
        true
    }

    /// Apply a wire call. `None` when unauthorized, unknown or deleted.
    pub fn call_from(&self, user: &User, public_method: &str, parameters: &[Value]) -> Option<Value> {
        let internal = {
            let inner = self.inner.borrow();
            if inner.deleted {
                return None;
            }
            let internal = inner.method_names.get(public_method)?.clone();
            if !inner.methods[&internal].call.contains(user) {
                log::trace!(
                    "unauthorized call of {} by user {} dropped",
                    public_method,
                    user.id()
                );
                return None;
            }
            internal
        };
        self.invoke(&internal, Some(user), parameters)
    }

    /// Delete the entity. Idempotent; everything pending for it is dropped
    /// at flush time.
    pub fn delete(&self) {
        let (channel, owner, state, computed, hooks, type_name, id) = {
            let mut inner = self.inner.borrow_mut();
            if inner.deleted {
                return;
            }
            inner.deleted = true;
            (
                inner.channel.clone(),
                inner.owner.take(),
                inner.state.clone(),
                std::mem::take(&mut inner.computed),
                std::mem::take(&mut inner.delete_hooks),
                inner.type_name.clone(),
                inner.id.clone(),
            )
        };

        // Hooks run while the state is still intact.
        for hook in &hooks {
            hook(self);
        }
        for property in &computed {
            property.disable();
        }
        state.remove_all_listeners();
        if let Some(channel) = channel.upgrade() {
            channel.forget_entity(&type_name, &id);
        }
        if let Some(owner) = owner {
            owner.forget_owned(&type_name, &id);
        }
        log::debug!("deleted {}", self.path());
    }
}

fn split_root(key: &str) -> (&str, Option<&str>) {
    match key.split_once('.') {
        Some((root, rest)) => (root, Some(rest)),
        None => (key, None),
    }
}

/// Walk a dotted key down the child tree, returning the node owning the
/// final segment.
fn descend(state: &WatchedObject, key: &str) -> Option<(WatchedObject, String)> {
    let mut node = state.clone();
    let mut remaining = key;
    while let Some((head, rest)) = remaining.split_once('.') {
        node = node.child(head)?;
        remaining = rest;
    }
    Some((node, remaining.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntitySchema;
    use crate::usergroup::testing::recording_user;
    use crate::protocol::{Output, OutputBody};
    use serde_json::json;

    fn diffs_for(outputs: &[Output], path: &str) -> Vec<serde_json::Map<String, Value>> {
        outputs
            .iter()
            .filter_map(|o| match &o.body {
                OutputBody::View { changes } => Some(changes.clone()),
                _ => None,
            })
            .flatten()
            .filter(|c| c.path == path)
            .map(|c| c.diff)
            .collect()
    }

    fn player_registry() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::build("Player")
                    .input("name")
                    .output("score")
                    .hidden("secret")
                    .computed("total", |state| {
                        let score = state.get("score").as_i64().unwrap_or(0);
                        let bonus = state.get("bonus").as_i64().unwrap_or(0);
                        json!(score + bonus)
                    })
                    .output("bonus")
                    .method(
                        "cheer",
                        GroupRole::Owners,
                        GroupRole::Viewers,
                        |_entity, _caller, params| json!(format!("cheer x{}", params.len())),
                    )
                    .finish(),
            )
            .unwrap();
        registry
    }

    fn spawn_player(
        registry: &SchemaRegistry,
        scheduler: &Scheduler,
        channel: &Channel,
        owner: Option<&User>,
    ) -> Entity {
        Entity::spawn(
            registry,
            scheduler,
            channel,
            owner,
            "Player",
            json!({"name": "?", "score": 0, "secret": "s3cret", "bonus": 0}),
            HashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_spawn_queues_full_visible_state() {
        let scheduler = Scheduler::new();
        let registry = player_registry();
        let channel = Channel::new(&scheduler, "Lobby");
        let (viewer, sink) = recording_user();
        viewer.join(&channel);

        let entity = spawn_player(&registry, &scheduler, &channel, None);
        scheduler.run_until_idle();

        let diffs = diffs_for(&sink.outputs.borrow(), &entity.path());
        assert_eq!(diffs.len(), 1);
        let diff = &diffs[0];
        assert_eq!(diff["name"], json!("?"));
        assert_eq!(diff["score"], json!(0));
        assert_eq!(diff["total"], json!(0));
        // Hidden properties never reach a client.
        assert!(!diff.contains_key("secret"));
    }

    #[test]
    fn test_writes_coalesce_to_final_value() {
        let scheduler = Scheduler::new();
        let registry = player_registry();
        let channel = Channel::new(&scheduler, "Lobby");
        let (viewer, sink) = recording_user();
        viewer.join(&channel);
        let entity = spawn_player(&registry, &scheduler, &channel, None);
        scheduler.run_until_idle();
        sink.outputs.borrow_mut().clear();

        entity.set("score", json!(5));
        entity.set("score", json!(7));
        scheduler.run_until_idle();

        let diffs = diffs_for(&sink.outputs.borrow(), &entity.path());
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0]["score"], json!(7));
    }

    #[test]
    fn test_owner_scoped_keys_share_one_view_frame_per_tick() {
        let scheduler = Scheduler::new();
        let registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::build("Player")
                    .output_for("hand", GroupRole::Owners)
                    .output_for("gold", GroupRole::Owners)
                    .finish(),
            )
            .unwrap();
        let channel = Channel::new(&scheduler, "Lobby");
        let (owner, sink) = recording_user();
        owner.join(&channel);
        let entity = Entity::spawn(
            &registry,
            &scheduler,
            &channel,
            Some(&owner),
            "Player",
            json!({"hand": [], "gold": 0}),
            HashMap::new(),
        )
        .unwrap();
        scheduler.run_until_idle();
        sink.outputs.borrow_mut().clear();

        entity.set("hand", json!(["ace"]));
        entity.set("gold", json!(25));
        scheduler.run_until_idle();

        let diffs = diffs_for(&sink.outputs.borrow(), &entity.path());
        assert_eq!(diffs.len(), 1, "one view frame per recipient per tick");
        assert_eq!(diffs[0]["hand"], json!(["ace"]));
        assert_eq!(diffs[0]["gold"], json!(25));
    }

    #[test]
    fn test_unchanged_write_not_broadcast() {
        let scheduler = Scheduler::new();
        let registry = player_registry();
        let channel = Channel::new(&scheduler, "Lobby");
        let (viewer, sink) = recording_user();
        viewer.join(&channel);
        let entity = spawn_player(&registry, &scheduler, &channel, None);
        scheduler.run_until_idle();
        sink.outputs.borrow_mut().clear();

        entity.set("score", json!(0));
        scheduler.run_until_idle();

        assert!(diffs_for(&sink.outputs.borrow(), &entity.path()).is_empty());
    }

    #[test]
    fn test_computed_property_broadcasts_like_state() {
        let scheduler = Scheduler::new();
        let registry = player_registry();
        let channel = Channel::new(&scheduler, "Lobby");
        let (viewer, sink) = recording_user();
        viewer.join(&channel);
        let entity = spawn_player(&registry, &scheduler, &channel, None);
        scheduler.run_until_idle();
        sink.outputs.borrow_mut().clear();

        entity.set("score", json!(3));
        entity.set("bonus", json!(4));
        scheduler.run_until_idle();
        // Synthetic writes land in the tick after the triggering batch.
        scheduler.run_until_idle();

        let diffs = diffs_for(&sink.outputs.borrow(), &entity.path());
        let total = diffs
            .iter()
            .find_map(|d| d.get("total").cloned())
            .expect("computed value broadcast");
        assert_eq!(total, json!(7));
    }

    #[test]
    fn test_owner_may_write_input_viewer_may_not() {
        let scheduler = Scheduler::new();
        let registry = player_registry();
        let channel = Channel::new(&scheduler, "Lobby");
        let (owner, _) = recording_user();
        let (viewer, _) = recording_user();
        owner.join(&channel);
        viewer.join(&channel);
        let entity = spawn_player(&registry, &scheduler, &channel, Some(&owner));

        assert!(entity.write_from(&owner, "name", json!("Alice")));
        assert!(!entity.write_from(&viewer, "name", json!("Mallory")));
        assert!(!entity.write_from(&owner, "score", json!(999)));
        assert!(!entity.write_from(&owner, "secret", json!("x")));

        assert_eq!(entity.get("name"), json!("Alice"));
        assert_eq!(entity.get("score"), json!(0));
    }

    #[test]
    fn test_call_fans_out_and_returns() {
        let scheduler = Scheduler::new();
        let registry = player_registry();
        let channel = Channel::new(&scheduler, "Lobby");
        let (owner, _) = recording_user();
        let (viewer, viewer_sink) = recording_user();
        owner.join(&channel);
        viewer.join(&channel);
        let entity = spawn_player(&registry, &scheduler, &channel, Some(&owner));

        let returned = entity.call_from(&owner, "cheer", &[json!(1), json!(2)]);
        assert_eq!(returned, Some(json!("cheer x2")));

        // Viewers hear the call immediately, without a tick.
        let outputs = viewer_sink.outputs.borrow();
        let heard = outputs.iter().any(|o| {
            matches!(&o.body, OutputBody::Call { method, returned_value, .. }
                if method == "cheer" && *returned_value == json!("cheer x2"))
        });
        assert!(heard);

        // Viewers are not allowed to invoke an owner-only method.
        drop(outputs);
        assert_eq!(entity.call_from(&viewer, "cheer", &[]), None);
    }

    #[test]
    fn test_action_is_callable_by_any_viewer() {
        let scheduler = Scheduler::new();
        let registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::build("Player")
                    .action("wave", |_entity, _caller, _params| json!("hi"))
                    .finish(),
            )
            .unwrap();
        let channel = Channel::new(&scheduler, "Lobby");
        let (owner, _) = recording_user();
        let (viewer, _) = recording_user();
        owner.join(&channel);
        viewer.join(&channel);
        let entity = Entity::spawn(
            &registry,
            &scheduler,
            &channel,
            Some(&owner),
            "Player",
            json!({}),
            HashMap::new(),
        )
        .unwrap();

        assert_eq!(entity.call_from(&viewer, "wave", &[]), Some(json!("hi")));
        assert_eq!(entity.call_from(&owner, "wave", &[]), Some(json!("hi")));
    }

    #[test]
    fn test_deleted_entity_is_inert() {
        let scheduler = Scheduler::new();
        let registry = player_registry();
        let channel = Channel::new(&scheduler, "Lobby");
        let (owner, sink) = recording_user();
        owner.join(&channel);
        let entity = spawn_player(&registry, &scheduler, &channel, Some(&owner));
        scheduler.run_until_idle();
        sink.outputs.borrow_mut().clear();

        entity.set("score", json!(5));
        entity.delete();
        entity.delete();

        entity.set("score", json!(9));
        assert_eq!(entity.invoke("cheer", None, &[]), None);
        scheduler.run_until_idle();

        assert!(diffs_for(&sink.outputs.borrow(), &entity.path()).is_empty());
        assert!(channel.find_entity("Player", &entity.id()).is_none());
        assert!(owner.owned_entities().is_empty());
    }

    #[test]
    fn test_delete_hook_runs_once_with_state_intact() {
        let scheduler = Scheduler::new();
        let registry = SchemaRegistry::new();
        let last_score: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        let captured = last_score.clone();
        registry
            .register(
                EntitySchema::build("Player")
                    .output("score")
                    .on_delete(move |entity| {
                        *captured.borrow_mut() = Some(entity.get("score"));
                    })
                    .finish(),
            )
            .unwrap();
        let channel = Channel::new(&scheduler, "Lobby");
        let entity = Entity::spawn(
            &registry,
            &scheduler,
            &channel,
            None,
            "Player",
            json!({"score": 11}),
            HashMap::new(),
        )
        .unwrap();

        entity.delete();
        entity.delete();

        assert_eq!(*last_score.borrow(), Some(json!(11)));
    }

    #[test]
    fn test_nested_writes_broadcast_with_dotted_keys() {
        let scheduler = Scheduler::new();
        let registry = SchemaRegistry::new();
        registry
            .register(EntitySchema::build("Marker").shared("pos").finish())
            .unwrap();
        let channel = Channel::new(&scheduler, "Map");
        let (viewer, sink) = recording_user();
        viewer.join(&channel);
        let entity = Entity::spawn(
            &registry,
            &scheduler,
            &channel,
            None,
            "Marker",
            json!({"pos": {"x": 0, "y": 0}}),
            HashMap::new(),
        )
        .unwrap();
        scheduler.run_until_idle();
        sink.outputs.borrow_mut().clear();

        entity.set("pos.x", json!(4));
        entity.write_from(&viewer, "pos.y", json!(2));
        scheduler.run_until_idle();

        let diffs = diffs_for(&sink.outputs.borrow(), &entity.path());
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0]["pos.x"], json!(4));
        assert_eq!(diffs[0]["pos.y"], json!(2));
    }

    #[test]
    fn test_alias_rewrites_wire_keys_both_ways() {
        let scheduler = Scheduler::new();
        let registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::build("Door")
                    .shared("open_state")
                    .alias("open_state", "open")
                    .finish(),
            )
            .unwrap();
        let channel = Channel::new(&scheduler, "House");
        let (user, sink) = recording_user();
        user.join(&channel);
        let entity = Entity::spawn(
            &registry,
            &scheduler,
            &channel,
            None,
            "Door",
            json!({"open_state": false}),
            HashMap::new(),
        )
        .unwrap();
        scheduler.run_until_idle();
        sink.outputs.borrow_mut().clear();

        assert!(entity.write_from(&user, "open", json!(true)));
        assert_eq!(entity.get("open_state"), json!(true));
        scheduler.run_until_idle();

        let diffs = diffs_for(&sink.outputs.borrow(), &entity.path());
        assert_eq!(diffs[0]["open"], json!(true));
        assert!(!diffs[0].contains_key("open_state"));
    }
}
