// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod aggregate;
pub mod api;
pub mod collect;
pub mod config;
pub mod judge;
pub mod prompt;
pub mod run;
pub mod scheduler;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::aggregate::Aggregate;
pub use crate::api::create_router;
pub use crate::store::{dedup_key, Evaluation, Item, JudgeResponse, Store};
