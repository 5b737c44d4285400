//! Audience groups: live user sets with per-tick view batching.
//!
//! A [`UserGroup`] wraps a [`Group<User>`] with two delivery paths:
//!
//! - [`read`](UserGroup::read) enqueues a state change into a debounced
//!   batch; at the end of the tick all changes are coalesced (later write
//!   wins per entity path and key) into one `view` frame per member.
//! - [`listen`](UserGroup::listen) fans a method call out to every member
//!   immediately, without batching.
//!
//! Changes from entities deleted before the flush are dropped, so a client
//! never receives a diff for something that no longer exists.

use std::collections::BTreeMap;

use serde_json::Value;
use statesync_core::group::Group;
use statesync_core::scheduler::{Debounced, Scheduler};

use crate::entity::Entity;
use crate::protocol::{OutputBody, ViewChange};
use crate::user::User;

/// One property write awaiting broadcast.
pub struct StateChange {
    pub entity: Entity,
    /// Public (aliased) key, dot-joined for nested writes.
    pub key: String,
    pub value: Value,
}

/// One method invocation to fan out.
pub struct MethodCall {
    pub entity: Entity,
    pub method: String,
    pub parameters: Vec<Value>,
    pub returned_value: Value,
}

/// A user set with view batching attached.
pub struct UserGroup {
    users: Group<User>,
    reads: Debounced<StateChange>,
}

impl Clone for UserGroup {
    fn clone(&self) -> Self {
        Self {
            users: self.users.clone(),
            reads: self.reads.clone(),
        }
    }
}

impl UserGroup {
    /// An unlocked, initially empty group.
    pub fn new(scheduler: &Scheduler) -> Self {
        Self::from_group(scheduler, Group::new())
    }

    /// A locked, permanently empty group.
    pub fn none(scheduler: &Scheduler) -> Self {
        Self::from_group(scheduler, Group::new().lock())
    }

    /// A locked group containing exactly one user.
    pub fn of_user(scheduler: &Scheduler, user: &User) -> Self {
        Self::from_group(scheduler, Group::with_items(vec![user.clone()]).lock())
    }

    /// A locked copy of a user set's current membership; later changes to
    /// the source are not observed.
    pub fn snapshot_of(scheduler: &Scheduler, users: &Group<User>) -> Self {
        Self::from_group(scheduler, users.clone_group().lock())
    }

    /// Attach view batching to an existing user set. The set is shared, not
    /// copied: membership changes after construction are observed.
    pub fn from_group(scheduler: &Scheduler, users: Group<User>) -> Self {
        let members = users.downgrade();
        let reads = Debounced::new(scheduler, move |batch: Vec<StateChange>| {
            let Some(members) = members.upgrade() else { return };
            let changes = coalesce(batch);
            if changes.is_empty() {
                return;
            }
            members.for_each(|user| {
                user.send(OutputBody::View {
                    changes: changes.clone(),
                });
            });
        });
        Self { users, reads }
    }

    pub fn contains(&self, user: &User) -> bool {
        self.users.has(user)
    }

    pub fn add(&self, user: User) {
        self.users.add(user);
    }

    pub fn remove(&self, user: &User) {
        self.users.remove(user);
    }

    pub fn members(&self) -> Vec<User> {
        self.users.items()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// The underlying live set, for composing audiences with set algebra.
    pub fn users(&self) -> &Group<User> {
        &self.users
    }

    /// Queue a state change for the end-of-tick view frame.
    pub fn read(&self, change: StateChange) {
        self.reads.push(change);
    }

    /// Fan a method call out to every member now.
    pub fn listen(&self, call: &MethodCall) {
        if call.entity.is_deleted() {
            return;
        }
        let path = call.entity.path();
        self.users.for_each(|user| {
            user.send(OutputBody::Call {
                path: path.clone(),
                method: call.method.clone(),
                parameters: call.parameters.clone(),
                returned_value: call.returned_value.clone(),
            });
        });
    }
}

/// Reduce a tick's worth of writes to one diff per entity path, keeping only
/// the final value of each key.
fn coalesce(batch: Vec<StateChange>) -> Vec<ViewChange> {
    let mut per_path: BTreeMap<String, serde_json::Map<String, Value>> = BTreeMap::new();
    for change in batch {
        if change.entity.is_deleted() {
            continue;
        }
        per_path
            .entry(change.entity.path())
            .or_default()
            .insert(change.key, change.value);
    }
    per_path
        .into_iter()
        .map(|(path, diff)| ViewChange { path, diff })
        .collect()
}

/// Recording sink used across the crate's tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::protocol::Output;
    use crate::user::{OutputSink, User};

    #[derive(Default)]
    pub struct RecordingSink {
        pub outputs: RefCell<Vec<Output>>,
    }

    impl OutputSink for RecordingSink {
        fn deliver(&self, output: &Output) {
            self.outputs.borrow_mut().push(output.clone());
        }
    }

    pub fn recording_user() -> (User, Rc<RecordingSink>) {
        let sink = Rc::new(RecordingSink::default());
        let user = User::new(sink.clone());
        (user, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::recording_user;
    use super::*;
    use crate::protocol::OutputBody;
    use serde_json::json;

    fn view_frames(outputs: &[crate::protocol::Output]) -> Vec<Vec<ViewChange>> {
        outputs
            .iter()
            .filter_map(|o| match &o.body {
                OutputBody::View { changes } => Some(changes.clone()),
                _ => None,
            })
            .collect()
    }

    fn test_entity(scheduler: &Scheduler) -> Entity {
        use crate::channel::Channel;
        use crate::schema::SchemaRegistry;

        let registry = SchemaRegistry::new();
        registry
            .register(crate::schema::EntitySchema::build("Gauge").output("a").finish())
            .unwrap();
        let channel = Channel::new(scheduler, "Test");
        Entity::spawn(
            &registry,
            scheduler,
            &channel,
            None,
            "Gauge",
            json!({"a": 0}),
            Default::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_reads_coalesce_into_one_view_per_tick() {
        let scheduler = Scheduler::new();
        let group = UserGroup::new(&scheduler);
        let (user, sink) = recording_user();
        group.add(user);
        let entity = test_entity(&scheduler);
        // The entity's own broadcast path is not under test here.
        scheduler.run_until_idle();
        sink.outputs.borrow_mut().clear();

        group.read(StateChange {
            entity: entity.clone(),
            key: "a".into(),
            value: json!(5),
        });
        group.read(StateChange {
            entity: entity.clone(),
            key: "a".into(),
            value: json!(7),
        });
        group.read(StateChange {
            entity: entity.clone(),
            key: "b".into(),
            value: json!(1),
        });
        scheduler.run_until_idle();

        let frames = view_frames(&sink.outputs.borrow());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 1);
        assert_eq!(frames[0][0].path, entity.path());
        assert_eq!(frames[0][0].diff["a"], json!(7));
        assert_eq!(frames[0][0].diff["b"], json!(1));
    }

    #[test]
    fn test_deleted_entity_changes_are_dropped() {
        let scheduler = Scheduler::new();
        let group = UserGroup::new(&scheduler);
        let (user, sink) = recording_user();
        group.add(user);
        let entity = test_entity(&scheduler);
        scheduler.run_until_idle();
        sink.outputs.borrow_mut().clear();

        group.read(StateChange {
            entity: entity.clone(),
            key: "a".into(),
            value: json!(5),
        });
        entity.delete();
        scheduler.run_until_idle();

        assert!(view_frames(&sink.outputs.borrow()).is_empty());
    }

    #[test]
    fn test_listen_is_immediate_and_per_member() {
        let scheduler = Scheduler::new();
        let group = UserGroup::new(&scheduler);
        let (alice, alice_sink) = recording_user();
        let (bob, bob_sink) = recording_user();
        group.add(alice);
        group.add(bob);
        let entity = test_entity(&scheduler);

        group.listen(&MethodCall {
            entity,
            method: "ping".into(),
            parameters: vec![json!(1)],
            returned_value: json!("pong"),
        });

        for sink in [&alice_sink, &bob_sink] {
            let outputs = sink.outputs.borrow();
            let called = outputs.iter().any(|o| {
                matches!(&o.body, OutputBody::Call { method, .. } if method == "ping")
            });
            assert!(called, "call frame delivered without waiting for a tick");
        }
    }

    #[test]
    fn test_locked_constructors() {
        let scheduler = Scheduler::new();
        let (user, _) = recording_user();

        let nobody = UserGroup::none(&scheduler);
        assert!(nobody.is_empty());
        assert!(nobody.users().is_locked());

        let owner = UserGroup::of_user(&scheduler, &user);
        assert_eq!(owner.len(), 1);
        assert!(owner.contains(&user));
        assert!(owner.users().is_locked());
    }

    #[test]
    fn test_snapshot_freezes_membership_at_capture() {
        let scheduler = Scheduler::new();
        let (alice, alice_sink) = recording_user();
        let (bob, bob_sink) = recording_user();
        let source = Group::with_items(vec![alice.clone()]);

        let snapshot = UserGroup::snapshot_of(&scheduler, &source);
        source.add(bob.clone());

        assert!(snapshot.users().is_locked());
        assert!(snapshot.contains(&alice));
        assert!(!snapshot.contains(&bob));

        let entity = test_entity(&scheduler);
        scheduler.run_until_idle();
        alice_sink.outputs.borrow_mut().clear();

        snapshot.read(StateChange {
            entity,
            key: "a".into(),
            value: json!(3),
        });
        scheduler.run_until_idle();

        assert_eq!(view_frames(&alice_sink.outputs.borrow()).len(), 1);
        assert!(view_frames(&bob_sink.outputs.borrow()).is_empty());
    }
}
