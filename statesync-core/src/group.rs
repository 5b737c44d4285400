//! Reactive sets with live set algebra.
//!
//! A [`Group`] is an ordered-insertion, uniqueness-enforced collection that
//! emits an event for every effective membership change. The algebra
//! operators (`union`, `intersection`, `difference`, `symmetric difference`)
//! return *derived* groups whose membership is maintained incrementally by
//! listeners on their sources — each source mutation does O(listeners) work,
//! touching every source only when an existence check across all of them is
//! required (intersection adds, difference re-adds).
//!
//! Derived groups are permanently locked and keep their sources alive; the
//! source listeners in turn hold the derived group only weakly, so dropping
//! the last handle to a derived group halts its recomputation.
//!
//! ```
//! use statesync_core::group::Group;
//!
//! let a = Group::with_items(vec![1, 2, 3]);
//! let b = Group::with_items(vec![3, 4]);
//! let union = a.or(&[b.clone()]);
//!
//! b.add(5);
//! assert!(union.has(&5));
//! ```

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Membership change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent<T> {
    Added(T),
    Removed(T),
}

/// Handle returned by [`Group::on`], used to detach the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener<T> = Rc<dyn Fn(&GroupEvent<T>)>;

struct GroupInner<T> {
    items: Vec<T>,
    locked: bool,
    listeners: Vec<(ListenerId, Listener<T>)>,
    next_listener: u64,
    /// Sources a derived group must keep alive (intermediate unions included).
    retained: Vec<Group<T>>,
}

/// A reactive set. Cloning the handle aliases the same underlying group;
/// use [`Group::clone_group`] for an independent snapshot copy.
pub struct Group<T> {
    inner: Rc<RefCell<GroupInner<T>>>,
}

impl<T> Clone for Group<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Weak counterpart of a [`Group`] handle, held by derivation listeners.
pub struct WeakGroup<T> {
    inner: Weak<RefCell<GroupInner<T>>>,
}

impl<T> Clone for WeakGroup<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> WeakGroup<T> {
    pub fn upgrade(&self) -> Option<Group<T>> {
        self.inner.upgrade().map(|inner| Group { inner })
    }
}

impl<T: Clone + PartialEq + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(GroupInner {
                items: Vec::new(),
                locked: false,
                listeners: Vec::new(),
                next_listener: 0,
                retained: Vec::new(),
            })),
        }
    }

    /// Create a group seeded with the given items (duplicates collapse).
    pub fn with_items(items: Vec<T>) -> Self {
        let group = Self::new();
        for item in items {
            group.insert_item(item);
        }
        group
    }

    pub fn downgrade(&self) -> WeakGroup<T> {
        WeakGroup {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Add an item, if not already present.
    ///
    /// Returns `true` when membership actually changed; no event is emitted
    /// for an idempotent no-op.
    ///
    /// # Panics
    ///
    /// Panics when the group is locked — mutating a locked (derived or
    /// frozen) group is a programming error, not a recoverable condition.
    pub fn add(&self, item: T) -> bool {
        assert!(
            !self.is_locked(),
            "cannot directly add items to a locked group"
        );
        self.insert_item(item)
    }

    /// Add many items; returns, per item, whether membership changed.
    pub fn add_many(&self, items: &[T]) -> Vec<bool> {
        items.iter().map(|item| self.add(item.clone())).collect()
    }

    /// Remove an item, if present. Same locking and event rules as [`Group::add`].
    pub fn remove(&self, item: &T) -> bool {
        assert!(
            !self.is_locked(),
            "cannot directly remove items from a locked group"
        );
        self.remove_item(item)
    }

    /// Remove every item. Returns `false` when already empty.
    pub fn clear(&self) -> bool {
        assert!(
            !self.is_locked(),
            "cannot directly remove items from a locked group"
        );
        if self.is_empty() {
            return false;
        }
        for item in self.items() {
            self.remove_item(&item);
        }
        true
    }

    pub fn has(&self, item: &T) -> bool {
        self.inner.borrow().items.contains(item)
    }

    pub fn has_all(&self, items: &[T]) -> bool {
        items.iter().all(|item| self.has(item))
    }

    pub fn has_any(&self, items: &[T]) -> bool {
        items.iter().any(|item| self.has(item))
    }

    /// Whether the given items (ignoring duplicates) are exactly the members.
    pub fn has_only(&self, items: &[T]) -> bool {
        let mut unique: Vec<&T> = Vec::new();
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        self.len() == unique.len() && self.has_all(items)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    /// Snapshot of the members in insertion order.
    pub fn items(&self) -> Vec<T> {
        self.inner.borrow().items.clone()
    }

    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for item in self.items() {
            f(&item);
        }
    }

    /// Independent unlocked copy with the same members and no listeners.
    pub fn clone_group(&self) -> Group<T> {
        Group::with_items(self.items())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.borrow().locked
    }

    /// Forbid further direct mutation. Returns the handle for chaining.
    pub fn lock(self) -> Self {
        self.inner.borrow_mut().locked = true;
        self
    }

    pub fn unlock(self) -> Self {
        self.inner.borrow_mut().locked = false;
        self
    }

    /// Register a membership listener; fires on every effective add/remove.
    pub fn on(&self, listener: impl Fn(&GroupEvent<T>) + 'static) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, Rc::new(listener)));
        id
    }

    pub fn off(&self, id: ListenerId) {
        self.inner
            .borrow_mut()
            .listeners
            .retain(|(lid, _)| *lid != id);
    }

    pub fn remove_all_listeners(&self) {
        self.inner.borrow_mut().listeners.clear();
    }

    /// Membership insert that bypasses the lock; used by derivation
    /// maintenance and membership owners (join/leave).
    pub(crate) fn insert_item(&self, item: T) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.items.contains(&item) {
                return false;
            }
            inner.items.push(item.clone());
        }
        self.emit(&GroupEvent::Added(item));
        true
    }

    /// Membership removal counterpart of [`Group::insert_item`].
    pub(crate) fn remove_item(&self, item: &T) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            let Some(index) = inner.items.iter().position(|i| i == item) else {
                return false;
            };
            inner.items.remove(index);
        }
        self.emit(&GroupEvent::Removed(item.clone()));
        true
    }

    fn emit(&self, event: &GroupEvent<T>) {
        // Snapshot first: listeners may register/detach listeners or mutate
        // other groups while running.
        let listeners: Vec<Listener<T>> = self
            .inner
            .borrow()
            .listeners
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn set_locked(&self, locked: bool) {
        self.inner.borrow_mut().locked = locked;
    }

    fn retain_sources(&self, sources: &[Group<T>]) {
        self.inner
            .borrow_mut()
            .retained
            .extend(sources.iter().cloned());
    }

    // ── Derivations ────────────────────────────────────────────────

    /// Live union: a member of any source is a member of the result.
    pub fn union_of(sources: &[Group<T>]) -> Group<T> {
        let derived = Group::new();
        for source in sources {
            for item in source.items() {
                derived.insert_item(item);
            }
        }
        derived.retain_sources(sources);

        let weak_sources: Vec<WeakGroup<T>> = sources.iter().map(|s| s.downgrade()).collect();
        for source in sources {
            let weak = derived.downgrade();
            let all = weak_sources.clone();
            source.on(move |event| {
                let Some(derived) = weak.upgrade() else { return };
                match event {
                    GroupEvent::Added(item) => {
                        derived.insert_item(item.clone());
                    }
                    GroupEvent::Removed(item) => {
                        // The item leaves only once no source still has it.
                        let still_present = all
                            .iter()
                            .filter_map(|w| w.upgrade())
                            .any(|s| s.has(item));
                        if !still_present {
                            derived.remove_item(item);
                        }
                    }
                }
            });
        }

        derived.set_locked(true);
        derived
    }

    /// Live intersection: a member of every source is a member of the result.
    pub fn intersection_of(sources: &[Group<T>]) -> Group<T> {
        let derived = Group::new();
        if let Some(first) = sources.first() {
            for item in first.items() {
                if sources[1..].iter().all(|s| s.has(&item)) {
                    derived.insert_item(item);
                }
            }
        }
        derived.retain_sources(sources);

        let weak_sources: Vec<WeakGroup<T>> = sources.iter().map(|s| s.downgrade()).collect();
        for source in sources {
            let weak = derived.downgrade();
            let all = weak_sources.clone();
            source.on(move |event| {
                let Some(derived) = weak.upgrade() else { return };
                match event {
                    GroupEvent::Added(item) => {
                        let everywhere = all
                            .iter()
                            .filter_map(|w| w.upgrade())
                            .all(|s| s.has(item));
                        if everywhere {
                            derived.insert_item(item.clone());
                        }
                    }
                    GroupEvent::Removed(item) => {
                        derived.remove_item(item);
                    }
                }
            });
        }

        derived.set_locked(true);
        derived
    }

    /// Live difference: members of `base` absent from the union of `excluded`.
    pub fn difference_of(base: &Group<T>, excluded: &[Group<T>]) -> Group<T> {
        let unwanted = match excluded.len() {
            0 => Group::new(),
            1 => excluded[0].clone(),
            _ => Group::union_of(excluded),
        };

        let derived = Group::new();
        for item in base.items() {
            if !unwanted.has(&item) {
                derived.insert_item(item);
            }
        }
        derived.retain_sources(&[base.clone(), unwanted.clone()]);

        {
            let weak = derived.downgrade();
            let unwanted_w = unwanted.downgrade();
            base.on(move |event| {
                let Some(derived) = weak.upgrade() else { return };
                match event {
                    GroupEvent::Added(item) => {
                        let blocked = unwanted_w.upgrade().is_some_and(|u| u.has(item));
                        if !blocked {
                            derived.insert_item(item.clone());
                        }
                    }
                    GroupEvent::Removed(item) => {
                        derived.remove_item(item);
                    }
                }
            });
        }

        {
            let weak = derived.downgrade();
            let base_w = base.downgrade();
            unwanted.on(move |event| {
                let Some(derived) = weak.upgrade() else { return };
                match event {
                    GroupEvent::Added(item) => {
                        derived.remove_item(item);
                    }
                    GroupEvent::Removed(item) => {
                        // Re-check base membership before re-adding.
                        let in_base = base_w.upgrade().is_some_and(|b| b.has(item));
                        if in_base {
                            derived.insert_item(item.clone());
                        }
                    }
                }
            });
        }

        derived.set_locked(true);
        derived
    }

    /// Live symmetric difference: union minus intersection.
    pub fn symmetric_difference_of(sources: &[Group<T>]) -> Group<T> {
        let union = Group::union_of(sources);
        let intersection = Group::intersection_of(sources);
        Group::difference_of(&union, &[intersection])
    }

    /// Union of `self` and `others`.
    pub fn or(&self, others: &[Group<T>]) -> Group<T> {
        let mut sources = vec![self.clone()];
        sources.extend(others.iter().cloned());
        Group::union_of(&sources)
    }

    /// Intersection of `self` and `others`.
    pub fn and(&self, others: &[Group<T>]) -> Group<T> {
        let mut sources = vec![self.clone()];
        sources.extend(others.iter().cloned());
        Group::intersection_of(&sources)
    }

    /// Difference of `self` and the union of `others`.
    pub fn but(&self, others: &[Group<T>]) -> Group<T> {
        Group::difference_of(self, others)
    }

    /// Symmetric difference of `self` and `others`.
    pub fn xor(&self, others: &[Group<T>]) -> Group<T> {
        let mut sources = vec![self.clone()];
        sources.extend(others.iter().cloned());
        Group::symmetric_difference_of(&sources)
    }
}
