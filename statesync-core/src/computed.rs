//! Derived values with inferred dependencies.
//!
//! A [`ComputedProperty`] binds a pure algorithm to a [`WatchedObject`]: the
//! algorithm is evaluated once up front under read capture, and the exact set
//! of keys it touched becomes its dependency set. Writes to the reference are
//! batched per tick; when a batch contains a changed dependency the algorithm
//! re-runs, the dependency set is re-derived from scratch, and a changed
//! result is announced on the reference as a synthetic write:
//!
//! ```text
//! set("a", 5) ─┐
//! set("b", 1) ─┼─▶ debounce ─▶ deps hit? ─▶ re-eval ─▶ report_write("sum", ..)
//! set("a", 7) ─┘   (one tick)
//! ```
//!
//! Re-deriving dependencies each evaluation keeps conditional algorithms
//! honest: keys read only on an untaken branch stop triggering recomputes
//! once the branch flips.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::scheduler::{Debounced, Scheduler};
use crate::watched::{Value, WatchEvent, WatchedObject};

#[derive(Debug, Clone)]
struct WriteRecord {
    key: String,
    old_value: Value,
    new_value: Value,
}

struct ComputedInner {
    key: String,
    value: Value,
    dependencies: BTreeSet<String>,
    disabled: bool,
}

/// A reactive derived property bound to one watched object.
pub struct ComputedProperty {
    inner: Rc<RefCell<ComputedInner>>,
}

impl Clone for ComputedProperty {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl ComputedProperty {
    /// Bind `algorithm` to `reference` under `key`, inferring dependencies
    /// from the initial evaluation.
    pub fn infer(
        reference: &WatchedObject,
        key: &str,
        scheduler: &Scheduler,
        algorithm: impl Fn(&WatchedObject) -> Value + 'static,
    ) -> ComputedProperty {
        Self::infer_pinned(reference, key, scheduler, &[], algorithm)
    }

    /// Like [`infer`](Self::infer), with extra always-tracked dependency keys
    /// on top of whatever the algorithm reads.
    pub fn infer_pinned(
        reference: &WatchedObject,
        key: &str,
        scheduler: &Scheduler,
        pinned: &[String],
        algorithm: impl Fn(&WatchedObject) -> Value + 'static,
    ) -> ComputedProperty {
        let algorithm: Rc<dyn Fn(&WatchedObject) -> Value> = Rc::new(algorithm);
        let pinned: BTreeSet<String> = pinned.iter().cloned().collect();

        let (value, mut dependencies) = reference.capture_reads(|r| algorithm(r));
        dependencies.extend(pinned.iter().cloned());

        let inner = Rc::new(RefCell::new(ComputedInner {
            key: key.to_string(),
            value,
            dependencies,
            disabled: false,
        }));

        let flush = {
            let inner = Rc::downgrade(&inner);
            let reference = reference.downgrade();
            let algorithm = Rc::clone(&algorithm);
            let pinned = pinned.clone();
            move |batch: Vec<WriteRecord>| {
                let Some(inner) = inner.upgrade() else { return };
                let Some(reference) = reference.upgrade() else { return };

                let triggered = {
                    let state = inner.borrow();
                    if state.disabled {
                        return;
                    }
                    batch.iter().any(|write| {
                        write.old_value != write.new_value
                            && state.dependencies.contains(&write.key)
                    })
                };
                if !triggered {
                    return;
                }

                let (new_value, mut fresh) = reference.capture_reads(|r| algorithm(r));
                fresh.extend(pinned.iter().cloned());

                let announce = {
                    let mut state = inner.borrow_mut();
                    state.dependencies = fresh;
                    if new_value != state.value {
                        let old_value = std::mem::replace(&mut state.value, new_value.clone());
                        Some((state.key.clone(), old_value))
                    } else {
                        None
                    }
                };
                if let Some((key, old_value)) = announce {
                    reference.report_write(&key, old_value, new_value);
                }
            }
        };
        let batcher = Debounced::new(scheduler, flush);

        let own_key = key.to_string();
        reference.on(move |event| {
            if let WatchEvent::Write {
                key,
                old_value,
                new_value,
            } = event
            {
                // Synthetic writes of this property must not re-trigger it.
                if *key != own_key {
                    batcher.push(WriteRecord {
                        key: key.clone(),
                        old_value: old_value.clone(),
                        new_value: new_value.clone(),
                    });
                }
            }
        });

        ComputedProperty { inner }
    }

    pub fn key(&self) -> String {
        self.inner.borrow().key.clone()
    }

    /// The most recently computed value.
    pub fn value(&self) -> Value {
        self.inner.borrow().value.clone()
    }

    /// The dependency keys derived from the latest evaluation.
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.inner.borrow().dependencies.clone()
    }

    /// Stop reacting permanently. Batches already queued are discarded at
    /// flush time.
    pub fn disable(&self) {
        self.inner.borrow_mut().disabled = true;
    }
}
