//! Cache engine: query and mutation registration, invalidation fan-out.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::FutureExt;
use futures::future::join_all;
use metrics::{counter, histogram};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::config::{EngineConfig, UpdateMode};
use super::decorator::{Decorator, Settled};
use super::keys::KeyPath;
use super::mutation::{Mutation, MutationFn, MutationOutcome};
use super::query::{Query, Resolved, ResolverFn};
use super::registry::{CacheIndex, QueryId, Subscriber};
use crate::error::{BoxError, MutationError, QueryError};

const METRIC_INVALIDATIONS: &str = "depquery_invalidations_total";
const METRIC_INVALIDATION_MS: &str = "depquery_invalidation_ms";

struct EngineInner {
    config: EngineConfig,
    decorator: Option<Arc<dyn Decorator>>,
    index: Arc<CacheIndex>,
    next_query_id: AtomicU64,
}

/// Registers queries and mutations and re-evaluates queries whose declared
/// dependencies are invalidated.
///
/// Cloning an engine shares its index; pass clones to every call site that
/// registers queries or invalidates keys.
///
/// ```
/// use std::convert::Infallible;
///
/// use depquery::{Engine, EngineConfig, MutationOutcome, Resolved, key_path};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let engine = Engine::new(EngineConfig::default());
///
/// let users = engine.query(|| async {
///     Ok::<_, Infallible>(Resolved::new(vec!["ada"]).depends_on(key_path!["users"]))
/// });
/// assert_eq!(users.value().await.unwrap(), vec!["ada"]);
///
/// let add_user = engine.mutation(|| async {
///     Ok::<_, Infallible>(MutationOutcome::invalidate([key_path!["users"]]))
/// });
/// add_user.run().await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register a resolver using the engine's default update mode.
    ///
    /// The resolver is called synchronously whenever an evaluation starts. It
    /// may observe its own query, which reports `loading` until it settles. A
    /// panic in the resolver or its future settles the read to
    /// [`QueryError::Panicked`](crate::QueryError::Panicked).
    pub fn query<T, F, Fut, E>(&self, resolver: F) -> Query<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resolved<T>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.query_with_mode(self.inner.config.default_update(), resolver)
    }

    /// Register a resolver with an explicit update mode.
    pub fn query_with_mode<T, F, Fut, E>(&self, mode: UpdateMode, resolver: F) -> Query<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resolved<T>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let id = QueryId::new(self.inner.next_query_id.fetch_add(1, Ordering::Relaxed));
        let decorator = self.inner.decorator.clone();

        let resolver: ResolverFn<T> = Arc::new(move || {
            let resolving = resolver();
            let decorator = decorator.clone();
            async move {
                let resolved = resolving.await.map_err(QueryError::resolver)?;
                if let Some(decorator) = decorator {
                    let settled = Settled {
                        query_id: id,
                        value: &resolved.value,
                        depends: &resolved.depends,
                    };
                    decorator
                        .decorate(settled)
                        .await
                        .map_err(QueryError::decorator)?;
                }
                Ok(resolved)
            }
            .boxed()
        });

        debug!(query_id = %id, mode = %mode, "Query registered");
        Query::new(id, mode, resolver, Arc::downgrade(&self.inner.index))
    }

    /// Register a mutation.
    ///
    /// The callback may return anything convertible into a
    /// [`MutationOutcome`]; `()` invalidates nothing.
    pub fn mutation<F, Fut, O, E>(&self, callback: F) -> Mutation
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        O: Into<MutationOutcome>,
        E: Into<BoxError>,
    {
        let callback: MutationFn = Arc::new(move || {
            let running = callback();
            async move {
                running
                    .await
                    .map(Into::into)
                    .map_err(MutationError::failed)
            }
            .boxed()
        });

        Mutation::new(self.clone(), callback)
    }

    /// Re-evaluate every query subscribed under `key`.
    ///
    /// Returns once all triggered evaluations have settled; failures stay on
    /// the affected queries. A key nobody subscribed to is a no-op.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, key: &KeyPath) {
        let canonical = key.canonical();
        let subscribers = self.inner.index.subscribers(&canonical);
        self.fan_out(subscribers, canonical.as_str()).await;
    }

    /// Re-evaluate every subscribed query exactly once.
    #[instrument(skip(self))]
    pub async fn invalidate_all(&self) {
        let subscribers = self.inner.index.all_subscribers();
        self.fan_out(subscribers, "*").await;
    }

    async fn fan_out(&self, subscribers: Vec<Arc<dyn Subscriber>>, scope: &str) {
        counter!(METRIC_INVALIDATIONS).increment(1);

        if subscribers.is_empty() {
            debug!(scope, "Invalidation matched no queries");
            return;
        }

        let invalidation_id = Uuid::new_v4();
        let started_at = Instant::now();
        let query_count = subscribers.len();

        info!(
            invalidation_id = %invalidation_id,
            scope,
            query_count,
            "Cache invalidation starting"
        );

        let settling: Vec<_> = subscribers
            .into_iter()
            .map(|subscriber| {
                subscriber.flag();
                subscriber.settle()
            })
            .collect();
        join_all(settling).await;

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_INVALIDATION_MS).record(elapsed_ms);

        info!(
            invalidation_id = %invalidation_id,
            scope,
            query_count,
            elapsed_ms,
            "Cache invalidation drained"
        );
    }

    /// Number of canonical keys with at least one subscribed query.
    pub fn index_len(&self) -> usize {
        self.inner.index.key_count()
    }

    /// Queries currently subscribed under `key`, in subscription order.
    pub fn subscribers(&self, key: &KeyPath) -> Vec<QueryId> {
        self.inner
            .index
            .subscribers(&key.canonical())
            .iter()
            .map(|subscriber| subscriber.id())
            .collect()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("decorated", &self.inner.decorator.is_some())
            .field("index_len", &self.index_len())
            .finish()
    }
}

/// Builder for an [`Engine`] with an optional [`Decorator`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    decorator: Option<Arc<dyn Decorator>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn update(mut self, update: UpdateMode) -> Self {
        self.config.defaults.update = update;
        self
    }

    pub fn decorator(mut self, decorator: impl Decorator) -> Self {
        self.decorator = Some(Arc::new(decorator));
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                decorator: self.decorator,
                index: Arc::new(CacheIndex::new()),
                next_query_id: AtomicU64::new(0),
            }),
        }
    }
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("decorated", &self.decorator.is_some())
            .finish()
    }
}
