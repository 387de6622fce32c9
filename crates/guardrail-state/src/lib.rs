//! guardrail-state — embedded state store for the Guardrail controller.
//!
//! Backed by [redb](https://docs.rs/redb). Persists what must survive a
//! restart: every scope's circuit-breaker state, the emergency controller's
//! state, and the latest recommended limits.
//!
//! # Architecture
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! Recommendations use the composite key `{tenant}:{limit}` so one tenant's
//! set can be replaced with a prefix scan.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
