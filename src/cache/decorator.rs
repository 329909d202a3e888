//! Engine-wide post-processing of resolver results.

use std::any::Any;

use async_trait::async_trait;

use super::keys::KeyPath;
use super::registry::QueryId;
use crate::error::BoxError;

/// A successful resolver result, seen by the decorator before the query
/// stores it.
#[derive(Debug, Clone, Copy)]
pub struct Settled<'a> {
    pub query_id: QueryId,
    pub value: &'a (dyn Any + Send + Sync),
    pub depends: &'a [KeyPath],
}

impl<'a> Settled<'a> {
    /// The resolved value, if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&'a T> {
        self.value.downcast_ref::<T>()
    }
}

/// Hook invoked with every successful resolver result, for cross-cutting side
/// effects such as auditing or prefetching.
///
/// Returning an error fails the evaluation: the query settles to
/// [`QueryError::Decorator`](crate::QueryError::Decorator) and keeps its
/// previous subscriptions.
#[async_trait]
pub trait Decorator: Send + Sync + 'static {
    async fn decorate(&self, settled: Settled<'_>) -> Result<(), BoxError>;
}
