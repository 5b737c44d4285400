//! Observable object graphs.
//!
//! A [`WatchedObject`] pairs a JSON value tree (the backing state) with an
//! event source: every read, write, method call and deletion performed
//! through the handle is applied to the tree and reported as a
//! [`WatchEvent`]. Nested objects and arrays become child nodes whose events
//! are relayed upward re-keyed with dot-joined paths, so one flat listener on
//! the root observes the whole graph:
//!
//! ```text
//! root.child("position").set("x", 3)
//!        │
//!        ▼ Write { key: "x", .. }        (on the child)
//!        ▼ Write { key: "position.x" }   (relayed on the root)
//! ```
//!
//! Reassigning an object-valued key creates a fresh child node and
//! invalidates the previous one: a stale child handle keeps operating on its
//! now-detached subtree, but its events are no longer relayed to the parent.
//! Because the backing tree is an owned value, aliased or self-referential
//! graphs cannot be constructed; the node-identity check on relay is the
//! liveness guard.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Backing representation for watched state.
pub type Value = serde_json::Value;

/// Something observable happened on a watched object.
///
/// Keys are dot-joined paths relative to the watcher the event was observed
/// on; `old_value`/`new_value` are full snapshots of the affected key.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Read {
        key: String,
        value: Value,
    },
    /// Emitted unconditionally on every write, even when the value did not
    /// change — equality filtering is the consumer's concern.
    Write {
        key: String,
        old_value: Value,
        new_value: Value,
    },
    Call {
        key: String,
        parameters: Vec<Value>,
        returned_value: Value,
    },
    Delete {
        key: String,
        old_value: Value,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Read { key, .. }
            | WatchEvent::Write { key, .. }
            | WatchEvent::Call { key, .. }
            | WatchEvent::Delete { key, .. } => key,
        }
    }

    fn with_prefix(&self, prefix: &str) -> WatchEvent {
        let prefixed = |key: &str| format!("{prefix}.{key}");
        match self {
            WatchEvent::Read { key, value } => WatchEvent::Read {
                key: prefixed(key),
                value: value.clone(),
            },
            WatchEvent::Write {
                key,
                old_value,
                new_value,
            } => WatchEvent::Write {
                key: prefixed(key),
                old_value: old_value.clone(),
                new_value: new_value.clone(),
            },
            WatchEvent::Call {
                key,
                parameters,
                returned_value,
            } => WatchEvent::Call {
                key: prefixed(key),
                parameters: parameters.clone(),
                returned_value: returned_value.clone(),
            },
            WatchEvent::Delete { key, old_value } => WatchEvent::Delete {
                key: prefixed(key),
                old_value: old_value.clone(),
            },
        }
    }
}

/// Handle returned by [`WatchedObject::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Callable installed on a watched object; receives the node it lives on.
pub type MethodFn = Rc<dyn Fn(&WatchedObject, &[Value]) -> Value>;

type WatchListener = Rc<dyn Fn(&WatchEvent)>;

static NODE_IDS: AtomicU64 = AtomicU64::new(0);

struct WatchedInner {
    node_id: u64,
    /// Array nodes keep decimal-index keys and snapshot back to a list.
    is_list: bool,
    /// Leaf values, plus raw storage for ignored keys.
    values: BTreeMap<String, Value>,
    /// Live child nodes for object/array-valued keys.
    children: HashMap<String, WatchedObject>,
    ignore: HashSet<String>,
    methods: HashMap<String, MethodFn>,
    listeners: Vec<(ListenerId, WatchListener)>,
    next_listener: u64,
}

/// Cloneable handle over one node of a watched value tree.
pub struct WatchedObject {
    inner: Rc<RefCell<WatchedInner>>,
}

impl Clone for WatchedObject {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Weak counterpart of a [`WatchedObject`] handle, held by subscribers that
/// must not keep the object alive (computed-property flushes, relays).
pub struct WeakWatchedObject {
    inner: Weak<RefCell<WatchedInner>>,
}

impl Clone for WeakWatchedObject {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl WeakWatchedObject {
    pub fn upgrade(&self) -> Option<WatchedObject> {
        self.inner.upgrade().map(|inner| WatchedObject { inner })
    }
}

impl WatchedObject {
    /// Wrap an initial state. Non-object, non-array values produce an empty
    /// object node. `ignore` lists top-level keys that bypass interception
    /// entirely: they are stored raw and never emit events or become
    /// children.
    pub fn new(initial: Value, ignore: &[&str]) -> Self {
        let node = Self::blank(matches!(initial, Value::Array(_)));
        node.inner.borrow_mut().ignore = ignore.iter().map(|k| k.to_string()).collect();
        node.seed(initial);
        node
    }

    fn from_value(initial: Value) -> Self {
        let node = Self::blank(matches!(initial, Value::Array(_)));
        node.seed(initial);
        node
    }

    fn blank(is_list: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(WatchedInner {
                node_id: NODE_IDS.fetch_add(1, Ordering::Relaxed),
                is_list,
                values: BTreeMap::new(),
                children: HashMap::new(),
                ignore: HashSet::new(),
                methods: HashMap::new(),
                listeners: Vec::new(),
                next_listener: 0,
            })),
        }
    }

    fn seed(&self, initial: Value) {
        let entries: Vec<(String, Value)> = match initial {
            Value::Object(map) => map.into_iter().collect(),
            Value::Array(list) => list
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            _ => Vec::new(),
        };

        for (key, value) in entries {
            let ignored = self.inner.borrow().ignore.contains(&key);
            if !ignored && matches!(value, Value::Object(_) | Value::Array(_)) {
                self.adopt_child(&key, value);
            } else {
                self.inner.borrow_mut().values.insert(key, value);
            }
        }
    }

    pub fn node_id(&self) -> u64 {
        self.inner.borrow().node_id
    }

    pub fn downgrade(&self) -> WeakWatchedObject {
        WeakWatchedObject {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Read a key. Emits `Read` and returns a snapshot (`Null` if absent).
    pub fn get(&self, key: &str) -> Value {
        if self.is_ignored(key) {
            return self
                .inner
                .borrow()
                .values
                .get(key)
                .cloned()
                .unwrap_or(Value::Null);
        }
        let value = self.value_of(key);
        self.emit(&WatchEvent::Read {
            key: key.to_string(),
            value: value.clone(),
        });
        value
    }

    /// Live child handle for an object/array-valued key.
    ///
    /// The same node is returned on repeated reads until the key is
    /// reassigned. Emits `Read` like any other access.
    pub fn child(&self, key: &str) -> Option<WatchedObject> {
        if self.is_ignored(key) {
            return None;
        }
        let child = self.inner.borrow().children.get(key).cloned()?;
        self.emit(&WatchEvent::Read {
            key: key.to_string(),
            value: child.snapshot(),
        });
        Some(child)
    }

    /// Write a key. Emits `Write {key, old, new}` unconditionally; an
    /// object/array value becomes a fresh child node and the previous child
    /// (if any) is invalidated.
    pub fn set(&self, key: &str, value: Value) {
        if self.is_ignored(key) {
            self.inner.borrow_mut().values.insert(key.to_string(), value);
            return;
        }

        let old_value = self.value_of(key);
        {
            let mut inner = self.inner.borrow_mut();
            inner.values.remove(key);
            inner.children.remove(key);
        }

        if matches!(value, Value::Object(_) | Value::Array(_)) {
            self.adopt_child(key, value.clone());
        } else {
            self.inner
                .borrow_mut()
                .values
                .insert(key.to_string(), value.clone());
        }

        self.emit(&WatchEvent::Write {
            key: key.to_string(),
            old_value,
            new_value: value,
        });
    }

    /// Delete a key. Emits `Delete {key, old}` when the key was watched.
    pub fn delete(&self, key: &str) {
        if self.is_ignored(key) {
            self.inner.borrow_mut().values.remove(key);
            return;
        }

        let old_value = self.value_of(key);
        {
            let mut inner = self.inner.borrow_mut();
            inner.values.remove(key);
            inner.children.remove(key);
        }
        self.emit(&WatchEvent::Delete {
            key: key.to_string(),
            old_value,
        });
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let inner = self.inner.borrow();
        inner.values.contains_key(key) || inner.children.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        let mut keys: Vec<String> = inner.values.keys().cloned().collect();
        keys.extend(inner.children.keys().cloned());
        keys.sort();
        keys
    }

    /// Full value snapshot of this node and everything below it.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.borrow();
        let mut entries: Vec<(String, Value)> = inner
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.extend(
            inner
                .children
                .iter()
                .map(|(k, c)| (k.clone(), c.snapshot())),
        );

        if inner.is_list {
            entries.sort_by_key(|(k, _)| k.parse::<usize>().unwrap_or(usize::MAX));
            Value::Array(entries.into_iter().map(|(_, v)| v).collect())
        } else {
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                map.insert(k, v);
            }
            Value::Object(map)
        }
    }

    /// Install a callable under `key`.
    pub fn define_method(&self, key: &str, method: MethodFn) {
        self.inner
            .borrow_mut()
            .methods
            .insert(key.to_string(), method);
    }

    pub fn has_method(&self, key: &str) -> bool {
        self.inner.borrow().methods.contains_key(key)
    }

    /// Invoke a callable. Emits `Call {key, parameters, returned_value}`
    /// after the underlying function has executed. `None` if no callable is
    /// installed under `key`.
    pub fn invoke(&self, key: &str, parameters: &[Value]) -> Option<Value> {
        let method = self.inner.borrow().methods.get(key).cloned()?;
        let returned_value = method(self, parameters);
        self.emit(&WatchEvent::Call {
            key: key.to_string(),
            parameters: parameters.to_vec(),
            returned_value: returned_value.clone(),
        });
        Some(returned_value)
    }

    /// Report an externally dispatched call (the entity layer injects the
    /// calling user itself and reports the completed call here).
    pub fn report_call(&self, key: &str, parameters: &[Value], returned_value: Value) {
        self.emit(&WatchEvent::Call {
            key: key.to_string(),
            parameters: parameters.to_vec(),
            returned_value,
        });
    }

    /// Report a synthetic write that is not applied to the backing tree
    /// (computed-property propagation).
    pub fn report_write(&self, key: &str, old_value: Value, new_value: Value) {
        self.emit(&WatchEvent::Write {
            key: key.to_string(),
            old_value,
            new_value,
        });
    }

    pub fn on(&self, listener: impl Fn(&WatchEvent) + 'static) -> ListenerId {
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

    /// Run `f` against this node and collect the exact set of keys read
    /// during the call — the dependency-inference hook.
    pub fn capture_reads<R>(&self, f: impl FnOnce(&WatchedObject) -> R) -> (R, BTreeSet<String>) {
        let reads: Rc<RefCell<BTreeSet<String>>> = Rc::new(RefCell::new(BTreeSet::new()));
        let sink = reads.clone();
        let id = self.on(move |event| {
            if let WatchEvent::Read { key, .. } = event {
                sink.borrow_mut().insert(key.clone());
            }
        });
        let out = f(self);
        self.off(id);
        let captured = reads.borrow().clone();
        (out, captured)
    }

    fn is_ignored(&self, key: &str) -> bool {
        self.inner.borrow().ignore.contains(key)
    }

    fn value_of(&self, key: &str) -> Value {
        let inner = self.inner.borrow();
        if let Some(child) = inner.children.get(key) {
            return child.snapshot();
        }
        inner.values.get(key).cloned().unwrap_or(Value::Null)
    }

    /// Wrap `value` as a child node under `key` and relay its events upward
    /// while it remains the current child for that key.
    fn adopt_child(&self, key: &str, value: Value) {
        let child = WatchedObject::from_value(value);
        let child_id = child.node_id();
        let parent = Rc::downgrade(&self.inner);
        let key_owned = key.to_string();

        child.on(move |event| {
            let Some(parent) = parent.upgrade() else { return };
            let current = {
                parent
                    .borrow()
                    .children
                    .get(&key_owned)
                    .map(|c| c.node_id())
            };
            // Relays from a replaced child are dropped.
            if current == Some(child_id) {
                let handle = WatchedObject { inner: parent };
                handle.emit(&event.with_prefix(&key_owned));
            }
        });

        self.inner
            .borrow_mut()
            .children
            .insert(key.to_string(), child);
    }

    fn emit(&self, event: &WatchEvent) {
        let listeners: Vec<WatchListener> = self
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(object: &WatchedObject) -> Rc<RefCell<Vec<WatchEvent>>> {
        let events: Rc<RefCell<Vec<WatchEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        object.on(move |event| sink.borrow_mut().push(event.clone()));
        events
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let object = WatchedObject::new(json!({"a": 42, "b": "test"}), &[]);

        assert_eq!(object.get("a"), json!(42));
        object.set("a", json!(43));
        assert_eq!(object.get("a"), json!(43));
        assert_eq!(object.get("b"), json!("test"));
        assert_eq!(object.get("missing"), Value::Null);
    }

    #[test]
    fn test_write_event_carries_old_and_new() {
        let object = WatchedObject::new(json!({"a": 1}), &[]);
        let events = record(&object);

        object.set("a", json!(2));

        assert_eq!(
            *events.borrow(),
            vec![WatchEvent::Write {
                key: "a".into(),
                old_value: json!(1),
                new_value: json!(2),
            }]
        );
    }

    #[test]
    fn test_write_event_unconditional_on_equal_value() {
        let object = WatchedObject::new(json!({"a": 1}), &[]);
        let events = record(&object);

        object.set("a", json!(1));
        assert_eq!(events.borrow().len(), 1);
    }

    #[test]
    fn test_read_events_fire() {
        let object = WatchedObject::new(json!({"a": 1, "b": 2}), &[]);
        let events = record(&object);

        object.get("a");
        object.get("b");

        let keys: Vec<String> = events.borrow().iter().map(|e| e.key().to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_delete_removes_and_reports() {
        let object = WatchedObject::new(json!({"a": 1}), &[]);
        let events = record(&object);

        object.delete("a");

        assert!(!object.contains_key("a"));
        assert_eq!(
            *events.borrow(),
            vec![WatchEvent::Delete {
                key: "a".into(),
                old_value: json!(1),
            }]
        );
    }

    #[test]
    fn test_nested_events_are_rekeyed() {
        let object = WatchedObject::new(json!({"pos": {"x": 1, "y": 2}}), &[]);
        let events = record(&object);

        let pos = object.child("pos").unwrap();
        pos.set("x", json!(5));

        let borrowed = events.borrow();
        // child() itself emits a read of "pos".
        assert_eq!(borrowed[0].key(), "pos");
        assert_eq!(
            borrowed[1],
            WatchEvent::Write {
                key: "pos.x".into(),
                old_value: json!(1),
                new_value: json!(5),
            }
        );
    }

    #[test]
    fn test_deeply_nested_paths() {
        let object = WatchedObject::new(json!({"z": {"p": {"q": {"i": true}}}}), &[]);
        let events = record(&object);

        object
            .child("z")
            .unwrap()
            .child("p")
            .unwrap()
            .child("q")
            .unwrap()
            .set("i", json!(false));

        let last = events.borrow().last().cloned().unwrap();
        assert_eq!(
            last,
            WatchEvent::Write {
                key: "z.p.q.i".into(),
                old_value: json!(true),
                new_value: json!(false),
            }
        );
    }

    #[test]
    fn test_child_is_memoized_until_reassigned() {
        let object = WatchedObject::new(json!({"pos": {"x": 1}}), &[]);

        let first = object.child("pos").unwrap();
        let second = object.child("pos").unwrap();
        assert_eq!(first.node_id(), second.node_id());

        object.set("pos", json!({"x": 9}));
        let replaced = object.child("pos").unwrap();
        assert_ne!(first.node_id(), replaced.node_id());
    }

    #[test]
    fn test_stale_child_is_silenced() {
        let object = WatchedObject::new(json!({"pos": {"x": 1}}), &[]);
        let stale = object.child("pos").unwrap();

        object.set("pos", json!({"x": 9}));
        let events = record(&object);

        // The stale child still works on its detached subtree...
        stale.set("x", json!(42));
        assert_eq!(stale.get("x"), json!(42));

        // ...but the parent no longer observes it.
        assert!(events.borrow().is_empty());
        assert_eq!(object.child("pos").unwrap().get("x"), json!(9));
    }

    #[test]
    fn test_object_write_replaces_child() {
        let object = WatchedObject::new(json!({"pos": {"x": 1}}), &[]);
        let events = record(&object);

        object.set("pos", json!({"x": 2, "y": 3}));

        assert_eq!(
            *events.borrow(),
            vec![WatchEvent::Write {
                key: "pos".into(),
                old_value: json!({"x": 1}),
                new_value: json!({"x": 2, "y": 3}),
            }]
        );
        assert_eq!(object.snapshot(), json!({"pos": {"x": 2, "y": 3}}));
    }

    #[test]
    fn test_arrays_watched_with_index_keys() {
        let object = WatchedObject::new(json!({"list": [10, 20]}), &[]);
        let events = record(&object);

        let list = object.child("list").unwrap();
        assert_eq!(list.get("0"), json!(10));
        list.set("1", json!(99));
        list.set("2", json!(30));

        assert_eq!(object.snapshot(), json!({"list": [10, 99, 30]}));
        let last = events.borrow().last().cloned().unwrap();
        assert_eq!(last.key(), "list.2");
    }

    #[test]
    fn test_ignored_keys_bypass_interception() {
        let object = WatchedObject::new(json!({"id": "abc", "a": 1}), &["id"]);
        let events = record(&object);

        object.set("id", json!("def"));
        let _ = object.get("id");

        assert!(events.borrow().is_empty());
        assert_eq!(object.snapshot()["id"], json!("def"));

        object.set("a", json!(2));
        assert_eq!(events.borrow().len(), 1);
    }

    #[test]
    fn test_invoke_emits_call_after_execution() {
        let object = WatchedObject::new(json!({"hits": 0}), &[]);
        object.define_method(
            "hit",
            Rc::new(|node: &WatchedObject, params: &[Value]| {
                let amount = params.first().and_then(|v| v.as_i64()).unwrap_or(1);
                let hits = node.snapshot()["hits"].as_i64().unwrap_or(0);
                node.set("hits", json!(hits + amount));
                json!(hits + amount)
            }),
        );
        let events = record(&object);

        let returned = object.invoke("hit", &[json!(2)]);
        assert_eq!(returned, Some(json!(2)));
        assert_eq!(object.invoke("missing", &[]), None);

        let borrowed = events.borrow();
        // The method body's own write is observed first, then the call.
        assert!(matches!(&borrowed[0], WatchEvent::Write { key, .. } if key == "hits"));
        assert_eq!(
            borrowed[1],
            WatchEvent::Call {
                key: "hit".into(),
                parameters: vec![json!(2)],
                returned_value: json!(2),
            }
        );
    }

    #[test]
    fn test_capture_reads_is_exact() {
        let object = WatchedObject::new(json!({"a": 1, "b": 2, "pos": {"x": 3}}), &[]);

        let (sum, reads) = object.capture_reads(|proxy| {
            let a = proxy.get("a").as_i64().unwrap_or(0);
            let x = proxy
                .child("pos")
                .unwrap()
                .get("x")
                .as_i64()
                .unwrap_or(0);
            a + x
        });

        assert_eq!(sum, 4);
        let expected: Vec<&str> = vec!["a", "pos", "pos.x"];
        assert_eq!(reads.iter().map(|s| s.as_str()).collect::<Vec<_>>(), expected);

        // Reads outside the capture window are not recorded.
        let (_, later) = object.capture_reads(|proxy| proxy.get("b"));
        assert_eq!(later.len(), 1);
        assert!(later.contains("b"));
    }

    #[test]
    fn test_report_write_is_observable_but_not_applied() {
        let object = WatchedObject::new(json!({"a": 1}), &[]);
        let events = record(&object);

        object.report_write("sum", json!(0), json!(3));

        assert_eq!(events.borrow().len(), 1);
        assert!(!object.contains_key("sum"));
    }
}
