//! vigil-state — shared domain types and embedded state store for Vigil.
//!
//! Backed by [redb](https://docs.rs/redb), persists the append-only anomaly
//! history, scaling events, scaling policies and the singleton scaling
//! state so the engine can restore itself after a restart.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Anomaly and event IDs are zero-padded sequence numbers, so the natural
//! key order of a table is also creation order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
