//! # statesync-core — Reactive state engine for statesync
//!
//! Single-threaded reactive primitives: observable object trees, live set
//! algebra, tick-based scheduling, and dependency-inferred derived values.
//! The networking layer (`statesync-net`) builds entities, access policy and
//! the wire protocol on top of these.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   WatchEvent    ┌──────────────────┐
//! │ WatchedObject │ ──────────────► │ ComputedProperty │
//! │ (value tree)  │ ◄────────────── │ (derived values) │
//! └───────┬───────┘  report_write   └────────┬─────────┘
//!         │                                  │
//!         │ events         Debounced batches │
//!         ▼                                  ▼
//! ┌───────────────┐                 ┌──────────────────┐
//! │   Group<T>    │                 │    Scheduler     │
//! │ (live sets)   │                 │ (tick job queue) │
//! └───────────────┘                 └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`scheduler`] — Deferred job queue and per-tick debounced batching
//! - [`group`] — Observable sets with live union/intersection/difference
//! - [`watched`] — JSON value trees with read/write/call/delete interception
//! - [`computed`] — Derived properties with read-captured dependencies
//!
//! Everything here is `Rc`/`RefCell` based and deliberately not `Send`: one
//! engine instance owns its state on one thread, and the network layer pins
//! it to a local task set.

pub mod computed;
pub mod group;
pub mod scheduler;
pub mod watched;

pub use computed::ComputedProperty;
pub use group::{Group, GroupEvent, WeakGroup};
pub use scheduler::{Debounced, Scheduler};
pub use watched::{Value, WatchEvent, WatchedObject, WeakWatchedObject};
