//! Cooperative tick scheduling for batched reactive work.
//!
//! All entity mutation is synchronous; the only deferred execution in the
//! engine is batching. A [`Scheduler`] holds the jobs queued during the
//! current synchronous turn, and [`Scheduler::run_until_idle`] is the tick
//! boundary: it drains every queued job (including jobs queued by jobs)
//! before the next externally-triggered turn begins.
//!
//! [`Debounced`] is the per-burst batcher built on top: the first item pushed
//! into an empty queue schedules exactly one flush, later items are merely
//! appended, and the whole batch reaches the handler in originating order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// Cloneable handle over a FIFO of deferred jobs.
///
/// One scheduler is shared by everything that batches work within a process
/// (computed properties, user-group read queues). Draining it is what the
/// rest of the engine calls a "tick".
pub struct Scheduler {
    inner: Rc<RefCell<VecDeque<Box<dyn FnOnce()>>>>,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Queue a job to run at the end of the current turn.
    pub fn defer(&self, job: impl FnOnce() + 'static) {
        self.inner.borrow_mut().push_back(Box::new(job));
    }

    /// Whether any job is still queued.
    pub fn has_pending(&self) -> bool {
        !self.inner.borrow().is_empty()
    }

    /// Run queued jobs until none remain.
    ///
    /// Jobs queued while draining are processed in the same call, so a flush
    /// that triggers further batched work still completes within this tick.
    pub fn run_until_idle(&self) {
        let mut ran = 0usize;
        loop {
            let job = self.inner.borrow_mut().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => break,
            }
        }
        if ran > 0 {
            log::trace!("tick ran {ran} deferred jobs");
        }
    }
}

struct DebouncedInner<T> {
    queue: Vec<T>,
}

/// Batches items pushed within one turn and flushes them once per tick.
///
/// The flush closure holds only a weak reference to the queue: when the last
/// owner is dropped before the flush runs, the flush is a no-op. Handlers
/// that need a liveness check at flush time (disabled computed properties,
/// deleted entities) perform it themselves when the batch arrives.
pub struct Debounced<T> {
    inner: Rc<RefCell<DebouncedInner<T>>>,
    handler: Rc<dyn Fn(Vec<T>)>,
    scheduler: Scheduler,
}

impl<T> Clone for Debounced<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            handler: Rc::clone(&self.handler),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T: 'static> Debounced<T> {
    pub fn new(scheduler: &Scheduler, handler: impl Fn(Vec<T>) + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(DebouncedInner { queue: Vec::new() })),
            handler: Rc::new(handler),
            scheduler: scheduler.clone(),
        }
    }

    /// Append an item to the pending batch, scheduling a flush if the batch
    /// was empty.
    pub fn push(&self, item: T) {
        let first = {
            let mut inner = self.inner.borrow_mut();
            let first = inner.queue.is_empty();
            inner.queue.push(item);
            first
        };

        if first {
            let weak: Weak<RefCell<DebouncedInner<T>>> = Rc::downgrade(&self.inner);
            let handler = Rc::clone(&self.handler);
            self.scheduler.defer(move || {
                if let Some(cell) = weak.upgrade() {
                    let batch = std::mem::take(&mut cell.borrow_mut().queue);
                    if !batch.is_empty() {
                        handler(batch);
                    }
                }
            });
        }
    }

    /// Number of items waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }
}
