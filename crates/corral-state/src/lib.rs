//! corral-state — durable resource rows for the corral manager.
//!
//! Backed by [redb](https://docs.rs/redb). Rows are JSON-serialized
//! into the value column of a single `resources` table keyed by
//! resource id; the DAO surface is deliberately narrow (create / put /
//! get / list-by-status) so alternative stores can slot in behind it.
//!
//! The `ResourceStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::ResourceStore;
pub use types::*;
