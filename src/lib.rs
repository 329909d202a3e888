//! Dependency-keyed async query cache with explicit invalidation.
//!
//! Queries declare, alongside each computed value, the key paths their result
//! depends on. Mutations and manual calls invalidate key paths, and only the
//! queries subscribed under those keys are re-evaluated.
//!
//! ```
//! use std::convert::Infallible;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! use depquery::{Engine, MutationOutcome, Resolved, key_path};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = Engine::default();
//! let counter = Arc::new(AtomicU32::new(0));
//!
//! let reader = Arc::clone(&counter);
//! let count = engine.query(move || {
//!     let current = reader.load(Ordering::SeqCst);
//!     async move { Ok::<_, Infallible>(Resolved::new(current).depends_on(key_path!["counter"])) }
//! });
//! assert_eq!(count.value().await.unwrap(), 0);
//!
//! let writer = Arc::clone(&counter);
//! let increment = engine.mutation(move || {
//!     writer.fetch_add(1, Ordering::SeqCst);
//!     async { Ok::<_, Infallible>(MutationOutcome::invalidate([key_path!["counter"]])) }
//! });
//! increment.run().await.unwrap();
//!
//! assert_eq!(count.value().await.unwrap(), 1);
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod telemetry;

pub use cache::{
    CanonicalKey, Decorator, Defaults, Engine, EngineBuilder, EngineConfig, KeyPath, Mutation,
    MutationOutcome, Query, QueryFuture, QueryId, QueryResult, QueryStatus, Resolved, Settled,
    UpdateMode, canonicalize, canonicalize_map,
};
pub use error::{BoxError, MutationError, QueryError};
pub use serde_json::Value;
