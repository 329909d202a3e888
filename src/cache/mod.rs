//! Query cache engine.
//!
//! - **Keys**: `KeyPath` values canonicalized into `CanonicalKey` strings
//! - **Index**: canonical key -> ordered set of subscribed queries
//! - **Queries**: lazily or eagerly evaluated, re-run only when invalidated
//! - **Mutations**: side effects that name keys to invalidate
//!
//! ## Configuration
//!
//! The default update mode is controlled via `depquery.toml`:
//!
//! ```toml
//! [defaults]
//! update = "lazy"   # or "eager"
//! ```

mod config;
mod decorator;
mod engine;
mod keys;
mod lock;
mod mutation;
mod query;
mod registry;

pub use config::{Defaults, EngineConfig, UpdateMode};
pub use decorator::{Decorator, Settled};
pub use engine::{Engine, EngineBuilder};
pub use keys::{CanonicalKey, KeyPath, canonicalize, canonicalize_map};
pub use mutation::{Mutation, MutationOutcome};
pub use query::{Query, QueryFuture, QueryResult, QueryStatus, Resolved};
pub use registry::QueryId;
