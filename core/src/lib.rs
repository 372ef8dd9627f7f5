//! Core data model and shared plumbing for the fleet audit engine.

pub mod logging;
pub mod model;
pub mod store;

pub use model::*;
pub use store::{SnapshotStore, StoreError};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
