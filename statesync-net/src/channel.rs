//! Channels: the unit of presence and entity routing.
//!
//! A channel is a named space users join and leave. Every entity lives in
//! exactly one channel; the channel's user group is the default audience for
//! `Viewers`-scoped properties and methods. Deleting a channel cascades to
//! its entities and detaches its members.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use statesync_core::scheduler::Scheduler;
use uuid::Uuid;

use crate::entity::Entity;
use crate::usergroup::UserGroup;

/// Entity lookup table keyed by type name, then entity id.
#[derive(Default)]
pub struct EntityIndex {
    map: HashMap<String, HashMap<String, Entity>>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entity: &Entity) {
        self.map
            .entry(entity.type_name())
            .or_default()
            .insert(entity.id(), entity.clone());
    }

    pub fn find(&self, type_name: &str, id: &str) -> Option<Entity> {
        self.map.get(type_name)?.get(id).cloned()
    }

    pub fn remove(&mut self, type_name: &str, id: &str) -> Option<Entity> {
        let bucket = self.map.get_mut(type_name)?;
        let removed = bucket.remove(id);
        if bucket.is_empty() {
            self.map.remove(type_name);
        }
        removed
    }

    pub fn all(&self) -> Vec<Entity> {
        self.map
            .values()
            .flat_map(|bucket| bucket.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

struct ChannelInner {
    id: String,
    kind: String,
    users: UserGroup,
    entities: EntityIndex,
    deleted: bool,
}

/// Cloneable handle to one channel.
pub struct Channel {
    inner: Rc<RefCell<ChannelInner>>,
}

impl Clone for Channel {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Weak channel handle; entities hold their channel this way so that a
/// channel owning its entities does not form a reference cycle.
pub struct WeakChannel {
    inner: Weak<RefCell<ChannelInner>>,
}

impl Clone for WeakChannel {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

impl Channel {
    pub fn new(scheduler: &Scheduler, kind: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChannelInner {
                id: Uuid::new_v4().to_string(),
                kind: kind.into(),
                users: UserGroup::new(scheduler),
                entities: EntityIndex::new(),
                deleted: false,
            })),
        }
    }

    pub fn id(&self) -> String {
        self.inner.borrow().id.clone()
    }

    pub fn kind(&self) -> String {
        self.inner.borrow().kind.clone()
    }

    /// The channel's member group. Stays unlocked: join/leave mutate it.
    pub fn users(&self) -> UserGroup {
        self.inner.borrow().users.clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.borrow().deleted
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn find_entity(&self, type_name: &str, id: &str) -> Option<Entity> {
        self.inner.borrow().entities.find(type_name, id)
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.inner.borrow().entities.all()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.borrow().entities.len()
    }

    pub(crate) fn register_entity(&self, entity: &Entity) {
        self.inner.borrow_mut().entities.add(entity);
    }

    pub(crate) fn forget_entity(&self, type_name: &str, id: &str) {
        self.inner.borrow_mut().entities.remove(type_name, id);
    }

    /// Delete the channel: every entity in it is deleted and every member
    /// leaves. Idempotent.
    pub fn delete(&self) {
        let (entities, members) = {
            let mut inner = self.inner.borrow_mut();
            if inner.deleted {
                return;
            }
            inner.deleted = true;
            let entities = std::mem::take(&mut inner.entities);
            let members = inner.users.members();
            (entities, members)
        };

        for entity in entities.all() {
            entity.delete();
        }
        for user in members {
            user.leave(self);
        }

        log::debug!("channel {} deleted", self.id());
    }
}
