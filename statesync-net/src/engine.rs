//! The engine: one single-threaded sync universe.
//!
//! Owns the scheduler, the schema registry, every connected user and every
//! channel. The transport feeds it decoded [`Input`] frames via
//! [`apply`](Engine::apply) and drives reactions with [`tick`](Engine::tick);
//! everything in between (set algebra, debounced views, computed properties)
//! runs without locks because the whole engine lives on one local task set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;
use statesync_core::scheduler::Scheduler;

use crate::channel::Channel;
use crate::entity::Entity;
use crate::protocol::{Input, InputBody};
use crate::schema::{SchemaError, SchemaRegistry};
use crate::user::{OutputSink, User};
use crate::usergroup::UserGroup;

type ConnectHook = Rc<dyn Fn(&Engine, &User)>;
type MessageHook = Rc<dyn Fn(&Engine, &User, &Value) -> Option<Value>>;

struct EngineInner {
    users: HashMap<String, User>,
    channels: HashMap<String, Channel>,
    on_connect: Option<ConnectHook>,
    on_message: Option<MessageHook>,
}

/// Cloneable handle to one engine instance. Not `Send`.
pub struct Engine {
    scheduler: Scheduler,
    registry: Rc<SchemaRegistry>,
    inner: Rc<RefCell<EngineInner>>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            registry: Rc::clone(&self.registry),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Engine {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            scheduler: Scheduler::new(),
            registry: Rc::new(registry),
            inner: Rc::new(RefCell::new(EngineInner {
                users: HashMap::new(),
                channels: HashMap::new(),
                on_connect: None,
                on_message: None,
            })),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Host hook run for every new connection; typically joins the user to
    /// a channel and spawns their entities.
    pub fn on_connect(&self, hook: impl Fn(&Engine, &User) + 'static) {
        self.inner.borrow_mut().on_connect = Some(Rc::new(hook));
    }

    /// Host hook for opaque `message` frames; a returned value is sent back
    /// as a `message` frame.
    pub fn on_message(&self, hook: impl Fn(&Engine, &User, &Value) -> Option<Value> + 'static) {
        self.inner.borrow_mut().on_message = Some(Rc::new(hook));
    }

    pub fn connect(&self, sink: Rc<dyn OutputSink>) -> User {
        let user = User::new(sink);
        let hook = {
            let mut inner = self.inner.borrow_mut();
            inner.users.insert(user.id(), user.clone());
            inner.on_connect.clone()
        };
        log::info!("user {} connected", user.id());
        if let Some(hook) = hook {
            hook(self, &user);
        }
        user
    }

    pub fn disconnect(&self, user: &User) {
        user.disconnect();
        self.inner.borrow_mut().users.remove(&user.id());
        log::info!("user {} removed", user.id());
    }

    pub fn create_channel(&self, kind: impl Into<String>) -> Channel {
        let channel = Channel::new(&self.scheduler, kind);
        self.inner
            .borrow_mut()
            .channels
            .insert(channel.id(), channel.clone());
        channel
    }

    pub fn channel(&self, id: &str) -> Option<Channel> {
        self.inner.borrow().channels.get(id).cloned()
    }

    /// First channel of a kind, for hosts with one lobby-style channel.
    pub fn channel_of_kind(&self, kind: &str) -> Option<Channel> {
        self.inner
            .borrow()
            .channels
            .values()
            .find(|c| c.kind() == kind)
            .cloned()
    }

    pub fn delete_channel(&self, channel: &Channel) {
        self.inner.borrow_mut().channels.remove(&channel.id());
        channel.delete();
    }

    pub fn spawn(
        &self,
        channel: &Channel,
        owner: Option<&User>,
        type_name: &str,
        initial: Value,
        groups: HashMap<String, UserGroup>,
    ) -> Result<Entity, SchemaError> {
        Entity::spawn(
            &self.registry,
            &self.scheduler,
            channel,
            owner,
            type_name,
            initial,
            groups,
        )
    }

    /// Dispatch one decoded frame. Unauthorized or unresolvable operations
    /// are dropped without a reply; a successful call is answered with a
    /// `return` frame correlated to the input id.
    pub fn apply(&self, user: &User, input: &Input) {
        match &input.body {
            InputBody::Write { entity, changes } => {
                let Some(target) = user.find_entity(entity) else {
                    log::trace!("write to unresolvable entity {entity:?} dropped");
                    return;
                };
                for (key, value) in changes {
                    target.write_from(user, key, value.clone());
                }
            }
            InputBody::Call {
                entity,
                method,
                parameters,
            } => {
                let Some(target) = user.find_entity(entity) else {
                    log::trace!("call to unresolvable entity {entity:?} dropped");
                    return;
                };
                if let Some(returned_value) = target.call_from(user, method, parameters) {
                    user.send(crate::protocol::OutputBody::Return {
                        input_id: input.id.clone(),
                        returned_value,
                    });
                }
            }
            InputBody::Message(payload) => {
                let hook = self.inner.borrow().on_message.clone();
                if let Some(hook) = hook {
                    if let Some(reply) = hook(self, user, payload) {
                        user.send(crate::protocol::OutputBody::Message(reply));
                    }
                }
            }
        }
    }

    /// Run every queued reaction: debounced view flushes, computed property
    /// recomputes and whatever they enqueue in turn.
    pub fn tick(&self) {
        self.scheduler.run_until_idle();
    }

    pub fn user_count(&self) -> usize {
        self.inner.borrow().users.len()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.borrow().channels.len()
    }
}
