use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error accepted from resolvers, decorators and mutations.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Why an evaluation settled without a value.
///
/// Cloned into every reader of the same pending result, so sources are
/// reference counted.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("resolver failed: {0}")]
    Resolver(#[source] Arc<dyn StdError + Send + Sync>),
    #[error("decorator failed: {0}")]
    Decorator(#[source] Arc<dyn StdError + Send + Sync>),
    #[error("resolver panicked: {0}")]
    Panicked(String),
}

impl QueryError {
    pub fn resolver(err: impl Into<BoxError>) -> Self {
        Self::Resolver(Arc::from(err.into()))
    }

    pub fn decorator(err: impl Into<BoxError>) -> Self {
        Self::Decorator(Arc::from(err.into()))
    }

    pub(crate) fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolver(_) => "resolver",
            Self::Decorator(_) => "decorator",
            Self::Panicked(_) => "panic",
        }
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("mutation failed: {0}")]
    Failed(#[source] BoxError),
}

impl MutationError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        Self::Failed(err.into())
    }
}
