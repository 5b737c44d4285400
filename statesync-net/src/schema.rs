//! Entity schemas: declared shape, access roles and methods per entity type.
//!
//! A schema is built fluently and registered once:
//!
//! ```text
//! EntitySchema::build("Player")
//!     .input("name")                       // viewers see it, owner writes it
//!     .output("score")                     // viewers see it, nobody writes it
//!     .hidden("secret")                    // server-only
//!     .output_for("hand", GroupRole::Named("teammates"))
//!     .computed("total", |state| ...)
//!     .action("shoot", |entity, caller, params| ...)  // any viewer may call
//!     .finish()
//! ```
//!
//! Roles are symbolic at schema time; they resolve to concrete user groups
//! when an entity is spawned, against that instance's owner, channel and
//! named groups. The registry freezes on first spawn so every instance of a
//! type shares one immutable shape.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use statesync_core::watched::{Value, WatchedObject};

use crate::entity::Entity;
use crate::user::User;

/// Schema construction and resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema `{0}` is already registered")]
    Duplicate(String),
    #[error("no schema registered for `{0}`")]
    Unknown(String),
    #[error("registry is frozen, cannot register `{0}`")]
    Frozen(String),
    #[error("schema `{schema}` references undeclared group `{group}`")]
    UnknownGroup { schema: String, group: String },
    #[error("spawn of `{schema}` is missing instance group `{group}`")]
    MissingGroup { schema: String, group: String },
}

/// Symbolic audience, resolved per entity instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRole {
    /// The entity's owner (empty when the entity has no owner).
    Owners,
    /// Everybody in the entity's channel.
    Viewers,
    /// Locked empty group.
    Nobody,
    /// A named group supplied at spawn time.
    Named(String),
}

/// Handler for a schema method. Receives the entity, the calling user
/// (`None` for host-initiated calls) and the wire parameters.
pub type MethodHandler = Rc<dyn Fn(&Entity, Option<&User>, &[Value]) -> Value>;

/// Getter for a computed property.
pub type Getter = Rc<dyn Fn(&WatchedObject) -> Value>;

/// Hook run when an entity of this type is deleted.
pub type DeleteHook = Rc<dyn Fn(&Entity)>;

#[derive(Clone)]
pub struct PropertySpec {
    pub name: String,
    /// Public name on the wire; defaults to the internal name.
    pub alias: Option<String>,
    pub input: GroupRole,
    pub output: GroupRole,
    pub getter: Option<Getter>,
    /// Extra dependency keys tracked on top of what the getter reads.
    pub pinned: Vec<String>,
}

impl PropertySpec {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            alias: None,
            input: GroupRole::Nobody,
            output: GroupRole::Owners,
            getter: None,
            pinned: Vec::new(),
        }
    }

    pub fn public_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone)]
pub struct MethodSpec {
    pub name: String,
    pub alias: Option<String>,
    /// Who may invoke the method from the wire.
    pub call: GroupRole,
    /// Who hears the call event.
    pub event: GroupRole,
    pub handler: MethodHandler,
}

impl MethodSpec {
    pub fn public_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Immutable shape of one entity type.
#[derive(Clone)]
pub struct EntitySchema {
    name: String,
    properties: Vec<PropertySpec>,
    methods: Vec<MethodSpec>,
    /// Named groups every spawn of this type must supply.
    groups: Vec<String>,
    delete_hooks: Vec<DeleteHook>,
}

impl EntitySchema {
    pub fn build(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            schema: EntitySchema {
                name: name.into(),
                properties: Vec::new(),
                methods: Vec::new(),
                groups: Vec::new(),
                delete_hooks: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &[PropertySpec] {
        &self.properties
    }

    pub fn methods(&self) -> &[MethodSpec] {
        &self.methods
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn delete_hooks(&self) -> &[DeleteHook] {
        &self.delete_hooks
    }

    pub fn property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Validate that every `Named` role is declared via `group`.
    fn check_groups(&self) -> Result<(), SchemaError> {
        let mut roles: Vec<&GroupRole> = Vec::new();
        for p in &self.properties {
            roles.push(&p.input);
            roles.push(&p.output);
        }
        for m in &self.methods {
            roles.push(&m.call);
            roles.push(&m.event);
        }
        for role in roles {
            if let GroupRole::Named(group) = role {
                if !self.groups.contains(group) {
                    return Err(SchemaError::UnknownGroup {
                        schema: self.name.clone(),
                        group: group.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Fluent builder for [`EntitySchema`].
pub struct SchemaBuilder {
    schema: EntitySchema,
}

impl SchemaBuilder {
    /// Start from another schema's properties, methods and groups.
    pub fn extends(mut self, parent: &EntitySchema) -> Self {
        for p in &parent.properties {
            if self.schema.property(&p.name).is_none() {
                self.schema.properties.push(p.clone());
            }
        }
        for m in &parent.methods {
            if self.schema.method(&m.name).is_none() {
                self.schema.methods.push(m.clone());
            }
        }
        for g in &parent.groups {
            if !self.schema.groups.contains(g) {
                self.schema.groups.push(g.clone());
            }
        }
        self.schema
            .delete_hooks
            .extend(parent.delete_hooks.iter().cloned());
        self
    }

    fn property_mut(&mut self, name: &str) -> &mut PropertySpec {
        let pos = match self.schema.properties.iter().position(|p| p.name == name) {
            Some(pos) => pos,
            None => {
                self.schema.properties.push(PropertySpec::new(name));
                self.schema.properties.len() - 1
            }
        };
        &mut self.schema.properties[pos]
    }

    /// Viewers see it; nobody writes it from the wire.
    pub fn output(mut self, name: &str) -> Self {
        let p = self.property_mut(name);
        p.output = GroupRole::Viewers;
        p.input = GroupRole::Nobody;
        self
    }

    /// Viewers see it; the owner writes it.
    pub fn input(mut self, name: &str) -> Self {
        let p = self.property_mut(name);
        p.output = GroupRole::Viewers;
        p.input = GroupRole::Owners;
        self
    }

    /// Server-only: never broadcast, never writable from the wire.
    pub fn hidden(mut self, name: &str) -> Self {
        let p = self.property_mut(name);
        p.output = GroupRole::Nobody;
        p.input = GroupRole::Nobody;
        self
    }

    /// Viewers see it and may write it.
    pub fn shared(mut self, name: &str) -> Self {
        let p = self.property_mut(name);
        p.output = GroupRole::Viewers;
        p.input = GroupRole::Viewers;
        self
    }

    pub fn output_for(mut self, name: &str, role: GroupRole) -> Self {
        self.property_mut(name).output = role;
        self
    }

    pub fn input_for(mut self, name: &str, role: GroupRole) -> Self {
        self.property_mut(name).input = role;
        self
    }

    pub fn alias(mut self, name: &str, public: &str) -> Self {
        self.property_mut(name).alias = Some(public.to_string());
        self
    }

    /// A derived property, visible to viewers, recomputed from whatever its
    /// getter reads.
    pub fn computed(
        mut self,
        name: &str,
        getter: impl Fn(&WatchedObject) -> Value + 'static,
    ) -> Self {
        let p = self.property_mut(name);
        p.output = GroupRole::Viewers;
        p.input = GroupRole::Nobody;
        p.getter = Some(Rc::new(getter));
        self
    }

    /// Like [`computed`](Self::computed), with always-tracked extra keys.
    pub fn computed_pinned(
        mut self,
        name: &str,
        pinned: &[&str],
        getter: impl Fn(&WatchedObject) -> Value + 'static,
    ) -> Self {
        let mut keys: Vec<String> = pinned.iter().map(|k| k.to_string()).collect();
        let p = self.property_mut(name);
        p.output = GroupRole::Viewers;
        p.input = GroupRole::Nobody;
        p.getter = Some(Rc::new(getter));
        p.pinned.append(&mut keys);
        self
    }

    /// A method any viewer may call, heard by viewers. Owner-only methods
    /// use the explicit [`method`](Self::method) form.
    pub fn action(
        self,
        name: &str,
        handler: impl Fn(&Entity, Option<&User>, &[Value]) -> Value + 'static,
    ) -> Self {
        self.method(name, GroupRole::Viewers, GroupRole::Viewers, handler)
    }

    /// A method with explicit caller and audience roles.
    pub fn method(
        mut self,
        name: &str,
        call: GroupRole,
        event: GroupRole,
        handler: impl Fn(&Entity, Option<&User>, &[Value]) -> Value + 'static,
    ) -> Self {
        self.schema.methods.retain(|m| m.name != name);
        self.schema.methods.push(MethodSpec {
            name: name.to_string(),
            alias: None,
            call,
            event,
            handler: Rc::new(handler),
        });
        self
    }

    /// Run `hook` when an entity of this type is deleted, before it detaches
    /// from its channel and owner.
    pub fn on_delete(mut self, hook: impl Fn(&Entity) + 'static) -> Self {
        self.schema.delete_hooks.push(Rc::new(hook));
        self
    }

    /// Declare a named instance group that every spawn must supply.
    pub fn group(mut self, name: &str) -> Self {
        if !self.schema.groups.contains(&name.to_string()) {
            self.schema.groups.push(name.to_string());
        }
        self
    }

    pub fn finish(self) -> EntitySchema {
        self.schema
    }
}

/// Holds every registered schema; freezes on first spawn.
pub struct SchemaRegistry {
    schemas: RefCell<HashMap<String, EntitySchema>>,
    frozen: Cell<bool>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RefCell::new(HashMap::new()),
            frozen: Cell::new(false),
        }
    }

    pub fn register(&self, schema: EntitySchema) -> Result<(), SchemaError> {
        if self.frozen.get() {
            return Err(SchemaError::Frozen(schema.name.clone()));
        }
        schema.check_groups()?;
        let mut schemas = self.schemas.borrow_mut();
        if schemas.contains_key(&schema.name) {
            return Err(SchemaError::Duplicate(schema.name.clone()));
        }
        schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<EntitySchema, SchemaError> {
        self.schemas
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::Unknown(name.to_string()))
    }

    pub fn freeze(&self) {
        self.frozen.set(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get()
    }
}
