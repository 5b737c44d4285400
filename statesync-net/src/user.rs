//! Connected users and their delivery sinks.
//!
//! A [`User`] is the engine-side identity of one connection. The transport
//! hands the engine an [`OutputSink`]; everything the engine wants the
//! client to see goes through [`User::send`], which wraps the body in an
//! envelope with a fresh frame id. Entity visibility is resolved from the
//! user's current memberships only — there is no grace period for groups a
//! user has left.

use std::cell::RefCell;
use std::rc::Rc;

use uuid::Uuid;

use crate::channel::{Channel, EntityIndex};
use crate::entity::Entity;
use crate::protocol::{EntityIndexes, Output, OutputBody};
use crate::usergroup::UserGroup;

/// Where a user's outbound frames go. The server backs this with the
/// connection's outbound queue; tests back it with a recording buffer.
pub trait OutputSink {
    fn deliver(&self, output: &Output);
}

struct UserInner {
    id: String,
    sink: Rc<dyn OutputSink>,
    /// Entities this user owns, addressable without a channel qualifier.
    owned: EntityIndex,
    joined: Vec<Channel>,
}

/// Cloneable handle to one connected user.
pub struct User {
    inner: Rc<RefCell<UserInner>>,
}

impl Clone for User {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl User {
    pub fn new(sink: Rc<dyn OutputSink>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(UserInner {
                id: Uuid::new_v4().to_string(),
                sink,
                owned: EntityIndex::new(),
                joined: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> String {
        self.inner.borrow().id.clone()
    }

    /// Envelope and deliver one frame.
    pub fn send(&self, body: OutputBody) {
        let sink = Rc::clone(&self.inner.borrow().sink);
        sink.deliver(&Output {
            id: Uuid::new_v4().to_string(),
            body,
        });
    }

    /// Membership is evaluated against the group's current contents.
    pub fn belongs_to(&self, group: &UserGroup) -> bool {
        group.contains(self)
    }

    pub fn join(&self, channel: &Channel) {
        if self.has_joined(channel) {
            return;
        }
        self.inner.borrow_mut().joined.push(channel.clone());
        channel.users().add(self.clone());
        // Catch up on state that was broadcast before we were here.
        for entity in channel.entities() {
            entity.send_view_to(self);
        }
        log::debug!("user {} joined channel {}", self.id(), channel.id());
    }

    pub fn leave(&self, channel: &Channel) {
        self.inner.borrow_mut().joined.retain(|c| c != channel);
        channel.users().remove(self);
        log::debug!("user {} left channel {}", self.id(), channel.id());
    }

    pub fn has_joined(&self, channel: &Channel) -> bool {
        self.inner.borrow().joined.iter().any(|c| c == channel)
    }

    pub fn joined(&self) -> Vec<Channel> {
        self.inner.borrow().joined.clone()
    }

    /// Resolve a wire address to an entity: owned entities first, then the
    /// qualified channel, then every joined channel in join order. An
    /// `isOwned` address never falls back to channel lookup.
    pub fn find_entity(&self, indexes: &EntityIndexes) -> Option<Entity> {
        let inner = self.inner.borrow();
        if let Some(owned) = inner.owned.find(&indexes.entity_type, &indexes.id) {
            return Some(owned);
        }
        if indexes.is_owned {
            return None;
        }
        if let Some(channel_id) = &indexes.channel {
            return inner
                .joined
                .iter()
                .find(|c| c.id() == *channel_id)?
                .find_entity(&indexes.entity_type, &indexes.id);
        }
        inner
            .joined
            .iter()
            .find_map(|c| c.find_entity(&indexes.entity_type, &indexes.id))
    }

    pub fn owned_entities(&self) -> Vec<Entity> {
        self.inner.borrow().owned.all()
    }

    pub(crate) fn register_owned(&self, entity: &Entity) {
        self.inner.borrow_mut().owned.add(entity);
    }

    pub(crate) fn forget_owned(&self, type_name: &str, id: &str) {
        self.inner.borrow_mut().owned.remove(type_name, id);
    }

    /// Tear down on disconnect: owned entities are deleted, channel
    /// memberships are dropped.
    pub fn disconnect(&self) {
        let owned = self.owned_entities();
        for entity in owned {
            entity.delete();
        }
        let joined = self.joined();
        for channel in joined {
            self.leave(&channel);
        }
        log::debug!("user {} disconnected", self.id());
    }
}
