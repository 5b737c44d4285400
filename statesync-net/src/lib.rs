//! # statesync-net — Multi-user sync layer for statesync
//!
//! Shares server-authoritative entity state with many WebSocket clients:
//! schemas declare who may read and write what, audiences are live user
//! groups, and every change reaches every entitled client as a coalesced
//! per-tick diff.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   JSON frames   ┌────────────┐
//! │ SyncClient │ ◄──────────────► │ SyncServer │
//! │ (per user) │                  │ (LocalSet) │
//! └────────────┘                  └──────┬─────┘
//!                                        │
//!                                        ▼
//!                                 ┌────────────┐     ┌───────────┐
//!                                 │   Engine   │ ──▶ │  Channel  │
//!                                 │ (one tick  │     │ users +   │
//!                                 │  per frame)│     │ entities  │
//!                                 └──────┬─────┘     └─────┬─────┘
//!                                        │                 │
//!                                        ▼                 ▼
//!                                 ┌────────────┐     ┌───────────┐
//!                                 │   Entity   │ ──▶ │ UserGroup │
//!                                 │ (schema +  │     │ (debounced│
//!                                 │  policy)   │     │  views)   │
//!                                 └────────────┘     └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames (`write`/`call`/`message` in,
//!   `view`/`call`/`return`/`message` out)
//! - [`schema`] — Fluent entity schemas with symbolic access roles
//! - [`entity`] — Spawned entities: state wired to audience groups
//! - [`channel`] — Presence and entity routing
//! - [`user`] / [`usergroup`] — Connections, sinks and batched audiences
//! - [`engine`] — One single-threaded sync universe
//! - [`server`] / [`client`] — The WebSocket boundary

pub mod channel;
pub mod client;
pub mod engine;
pub mod entity;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod user;
pub mod usergroup;

pub use channel::{Channel, EntityIndex};
pub use client::{ClientError, SyncClient};
pub use engine::Engine;
pub use entity::Entity;
pub use protocol::{
    EntityIndexes, Input, InputBody, Output, OutputBody, ViewChange, WireError,
};
pub use schema::{EntitySchema, GroupRole, SchemaBuilder, SchemaError, SchemaRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use user::{OutputSink, User};
pub use usergroup::{MethodCall, StateChange, UserGroup};
