//! Side-effecting operations that invalidate cached queries.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, instrument};

use super::engine::Engine;
use super::keys::KeyPath;
use crate::error::MutationError;

pub(crate) type MutationFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<MutationOutcome, MutationError>> + Send + Sync>;

/// What a mutation asks the engine to do after it ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Key paths whose subscribers are re-evaluated before the mutation resolves.
    pub invalidate: Vec<KeyPath>,
}

impl MutationOutcome {
    /// No invalidation.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn invalidate(keys: impl IntoIterator<Item = KeyPath>) -> Self {
        Self {
            invalidate: keys.into_iter().collect(),
        }
    }

    pub fn and_invalidate(mut self, key: KeyPath) -> Self {
        self.invalidate.push(key);
        self
    }
}

impl From<()> for MutationOutcome {
    fn from((): ()) -> Self {
        Self::none()
    }
}

impl From<KeyPath> for MutationOutcome {
    fn from(key: KeyPath) -> Self {
        Self::invalidate([key])
    }
}

impl From<Vec<KeyPath>> for MutationOutcome {
    fn from(keys: Vec<KeyPath>) -> Self {
        Self::invalidate(keys)
    }
}

/// A registered mutation. Cheap to clone; every clone runs the same callback.
#[derive(Clone)]
pub struct Mutation {
    engine: Engine,
    callback: MutationFn,
}

impl Mutation {
    pub(crate) fn new(engine: Engine, callback: MutationFn) -> Self {
        Self { engine, callback }
    }

    /// Run the mutation, then invalidate every key it names.
    ///
    /// Resolves once all re-evaluations triggered by the invalidation have
    /// settled. A failing callback invalidates nothing.
    ///
    /// Key paths are invalidated one after another, so a query subscribed
    /// under two of them is re-evaluated once per key.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), MutationError> {
        let outcome = (self.callback)().await?;

        debug!(keys = outcome.invalidate.len(), "Mutation applied");

        for key in &outcome.invalidate {
            self.engine.invalidate(key).await;
        }

        Ok(())
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation").finish_non_exhaustive()
    }
}
