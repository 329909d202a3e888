//! Query evaluation state machine.
//!
//! A [`Query`] caches one resolver's asynchronous result. It evaluates at most
//! once at a time, re-evaluates only after being flagged dirty, and keeps its
//! subscriptions in the [`CacheIndex`] in step with the dependencies declared
//! by the most recent successful evaluation.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Shared};
use metrics::counter;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::config::UpdateMode;
use super::keys::{CanonicalKey, KeyPath};
use super::lock::mutex_lock;
use super::registry::{CacheIndex, QueryId, Subscriber};
use crate::error::QueryError;

const SOURCE: &str = "cache::query";
const METRIC_EVALUATIONS: &str = "depquery_query_evaluations_total";
const METRIC_FAILURES: &str = "depquery_query_failures_total";

/// Outcome of reading a query.
pub type QueryResult<T> = Result<T, QueryError>;

/// The pending or settled result of a query, shared by every reader.
pub type QueryFuture<T> = Shared<BoxFuture<'static, QueryResult<T>>>;

pub(crate) type ResolverFn<T> =
    Arc<dyn Fn() -> BoxFuture<'static, QueryResult<Resolved<T>>> + Send + Sync>;

type Resolving<T> = BoxFuture<'static, QueryResult<Resolved<T>>>;

/// What a resolver returns: the computed value and the keys it depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub depends: Vec<KeyPath>,
}

impl<T> Resolved<T> {
    /// A value with no dependencies; it is never found by keyed invalidation.
    pub fn new(value: T) -> Self {
        Self {
            value,
            depends: Vec::new(),
        }
    }

    pub fn depends_on(mut self, key: KeyPath) -> Self {
        self.depends.push(key);
        self
    }

    pub fn with_depends(mut self, depends: impl IntoIterator<Item = KeyPath>) -> Self {
        self.depends.extend(depends);
        self
    }
}

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Never evaluated.
    Empty,
    /// An evaluation is in flight.
    Loading,
    /// Holds a value that has not been invalidated.
    Settled,
    /// Holds a stale result pending re-evaluation.
    Dirty,
    /// The last evaluation failed; the error is the current result.
    Failed,
}

struct QueryState<T> {
    pending: Option<QueryFuture<T>>,
    latest: Option<T>,
    depends: Vec<KeyPath>,
    loading: bool,
    dirty: bool,
    failed: bool,
}

impl<T> QueryState<T> {
    fn new() -> Self {
        Self {
            pending: None,
            latest: None,
            depends: Vec::new(),
            loading: false,
            dirty: true,
            failed: false,
        }
    }

    fn status(&self) -> QueryStatus {
        if self.loading {
            QueryStatus::Loading
        } else if self.pending.is_none() {
            QueryStatus::Empty
        } else if self.dirty {
            QueryStatus::Dirty
        } else if self.failed {
            QueryStatus::Failed
        } else {
            QueryStatus::Settled
        }
    }
}

pub(crate) struct QueryInner<T> {
    id: QueryId,
    mode: UpdateMode,
    resolver: ResolverFn<T>,
    index: Weak<CacheIndex>,
    state: Mutex<QueryState<T>>,
}

fn canonical_keys(depends: &[KeyPath]) -> Vec<CanonicalKey> {
    depends.iter().map(KeyPath::canonical).collect()
}

fn panicked(payload: &(dyn Any + Send)) -> QueryError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    QueryError::panicked(message)
}

impl<T> QueryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start an evaluation unless the current result can be reused.
    ///
    /// The pending result is published under the state lock; the resolver is
    /// then invoked synchronously outside it, and its future is driven on a
    /// spawned task so it completes even when nobody awaits the result.
    fn evaluate(self: &Arc<Self>) -> QueryFuture<T> {
        let (pending, start) = {
            let mut state = mutex_lock(&self.state, SOURCE, "evaluate");

            if let Some(pending) = state.pending.as_ref() {
                if state.loading || !state.dirty {
                    return pending.clone();
                }
            }

            let old_keys = canonical_keys(&state.depends);
            state.loading = true;
            counter!(METRIC_EVALUATIONS).increment(1);
            debug!(query_id = %self.id, mode = %self.mode, "Query evaluation started");

            let (start, started) = oneshot::channel::<Resolving<T>>();
            let query = Arc::clone(self);
            let pending = async move {
                let outcome = match started.await {
                    Ok(resolving) => resolving.await,
                    Err(_) => Err(QueryError::panicked("evaluation abandoned before start")),
                };
                query.complete(outcome, old_keys)
            }
            .boxed()
            .shared();

            state.pending = Some(pending.clone());
            (pending, start)
        };

        // A panic in the resolver settles the evaluation instead of leaving
        // the query loading.
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| (self.resolver)()));
        let resolving: Resolving<T> = match invoked {
            Ok(resolving) => AssertUnwindSafe(resolving)
                .catch_unwind()
                .map(|caught| caught.unwrap_or_else(|payload| Err(panicked(&*payload))))
                .boxed(),
            Err(payload) => future::ready(Err(panicked(&*payload))).boxed(),
        };
        let _ = start.send(resolving);

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(pending.clone().map(|_| ()));
            }
            Err(_) => {
                debug!(query_id = %self.id, "No runtime available; evaluation runs when awaited");
            }
        }

        pending
    }

    /// Settle an evaluation: store the outcome and, on success, move the
    /// query's subscriptions to the newly declared keys.
    fn complete(
        self: &Arc<Self>,
        outcome: QueryResult<Resolved<T>>,
        old_keys: Vec<CanonicalKey>,
    ) -> QueryResult<T> {
        let mut state = mutex_lock(&self.state, SOURCE, "complete");
        state.loading = false;
        state.dirty = false;

        let Resolved { value, depends } = match outcome {
            Ok(resolved) => resolved,
            Err(err) => {
                state.failed = true;
                counter!(METRIC_FAILURES, "kind" => err.kind()).increment(1);
                warn!(query_id = %self.id, error = %err, "Query evaluation failed");
                return Err(err);
            }
        };

        let new_keys = canonical_keys(&depends);
        let dropped: Vec<CanonicalKey> = old_keys
            .into_iter()
            .filter(|key| !new_keys.contains(key))
            .collect();

        state.depends = depends;
        state.latest = Some(value.clone());
        state.failed = false;

        // Index updates happen under the state lock so readers never see a
        // settled query with stale subscriptions.
        if let Some(index) = self.index.upgrade() {
            index.unsubscribe(self.id, &dropped);
            let subscriber: Arc<dyn Subscriber> = Arc::clone(self) as Arc<dyn Subscriber>;
            index.subscribe(&new_keys, &subscriber);
        }

        debug!(
            query_id = %self.id,
            keys = new_keys.len(),
            dropped = dropped.len(),
            "Query settled"
        );

        Ok(value)
    }

    fn flag(&self) {
        mutex_lock(&self.state, SOURCE, "flag").dirty = true;
    }
}

impl<T> Subscriber for QueryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> QueryId {
        self.id
    }

    fn flag(&self) {
        QueryInner::flag(self);
    }

    fn settle(self: Arc<Self>) -> BoxFuture<'static, ()> {
        self.evaluate().map(|_| ()).boxed()
    }
}

/// Handle to a cached, possibly stale, asynchronous result.
///
/// Cloning the handle shares the same query.
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        id: QueryId,
        mode: UpdateMode,
        resolver: ResolverFn<T>,
        index: Weak<CacheIndex>,
    ) -> Self {
        let inner = Arc::new(QueryInner {
            id,
            mode,
            resolver,
            index,
            state: Mutex::new(QueryState::new()),
        });

        if mode == UpdateMode::Eager {
            // Fire and forget; readers pick up the same pending result.
            let _ = inner.evaluate();
        }

        Self { inner }
    }

    /// The current result, evaluating first if the query is empty or dirty.
    ///
    /// Reading a settled query returns the cached result without calling the
    /// resolver. Failures are returned as `Err` and are not retried until the
    /// query is invalidated or refreshed.
    pub fn value(&self) -> QueryFuture<T> {
        self.inner.evaluate()
    }

    /// Force a re-evaluation, unless one is already in flight.
    pub fn refresh(&self) -> QueryFuture<T> {
        self.inner.flag();
        self.inner.evaluate()
    }

    pub fn loading(&self) -> bool {
        mutex_lock(&self.inner.state, SOURCE, "loading").loading
    }

    pub fn is_dirty(&self) -> bool {
        mutex_lock(&self.inner.state, SOURCE, "is_dirty").dirty
    }

    pub fn status(&self) -> QueryStatus {
        mutex_lock(&self.inner.state, SOURCE, "status").status()
    }

    /// Dependencies declared by the last successful evaluation.
    pub fn depends(&self) -> Vec<KeyPath> {
        mutex_lock(&self.inner.state, SOURCE, "depends")
            .depends
            .clone()
    }

    /// The last successfully resolved value, without evaluating.
    pub fn latest(&self) -> Option<T> {
        mutex_lock(&self.inner.state, SOURCE, "latest")
            .latest
            .clone()
    }

    pub fn id(&self) -> QueryId {
        self.inner.id
    }

    pub fn mode(&self) -> UpdateMode {
        self.inner.mode
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = mutex_lock(&self.inner.state, SOURCE, "debug");
        f.debug_struct("Query")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("status", &state.status())
            .field("depends", &state.depends)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::key_path;

    fn counting(calls: &Arc<AtomicUsize>, depends: Vec<KeyPath>) -> ResolverFn<usize> {
        let calls = Arc::clone(calls);
        Arc::new(move || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            let depends = depends.clone();
            async move { Ok(Resolved::new(call).with_depends(depends)) }.boxed()
        })
    }

    fn failing(calls: &Arc<AtomicUsize>) -> ResolverFn<usize> {
        let calls = Arc::clone(calls);
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QueryError::resolver("backend unavailable")) }.boxed()
        })
    }

    fn query(
        index: &Arc<CacheIndex>,
        mode: UpdateMode,
        resolver: ResolverFn<usize>,
    ) -> Query<usize> {
        Query::new(QueryId::new(1), mode, resolver, Arc::downgrade(index))
    }

    #[tokio::test]
    async fn lazy_query_waits_for_first_read() {
        let index = Arc::new(CacheIndex::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query(&index, UpdateMode::Lazy, counting(&calls, vec![]));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(query.status(), QueryStatus::Empty);

        assert_eq!(query.value().await.expect("value"), 0);
        assert_eq!(query.value().await.expect("value"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.status(), QueryStatus::Settled);
    }

    #[tokio::test]
    async fn eager_query_calls_resolver_at_construction() {
        let index = Arc::new(CacheIndex::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query(&index, UpdateMode::Eager, counting(&calls, vec![]));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(query.loading());

        assert_eq!(query.value().await.expect("value"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_evaluation() {
        let index = Arc::new(CacheIndex::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query(&index, UpdateMode::Lazy, counting(&calls, vec![]));

        let (first, second) = futures::join!(query.value(), query.value());
        assert_eq!(first.expect("value"), second.expect("value"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_subscribes_declared_keys() {
        let index = Arc::new(CacheIndex::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query(
            &index,
            UpdateMode::Lazy,
            counting(&calls, vec![key_path!["a"], key_path!["b"]]),
        );

        assert_eq!(index.key_count(), 0);
        query.value().await.expect("value");

        let keys = index.keys_for(query.id());
        assert!(keys.contains(&key_path!["a"].canonical()));
        assert!(keys.contains(&key_path!["b"].canonical()));
        assert_eq!(query.depends(), vec![key_path!["a"], key_path!["b"]]);
    }

    #[tokio::test]
    async fn flagged_query_re_evaluates_on_read() {
        let index = Arc::new(CacheIndex::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query(&index, UpdateMode::Lazy, counting(&calls, vec![]));

        assert_eq!(query.value().await.expect("value"), 0);
        query.inner.flag();
        assert_eq!(query.status(), QueryStatus::Dirty);
        assert_eq!(query.value().await.expect("value"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn flag_during_flight_does_not_start_second_evaluation() {
        let index = Arc::new(CacheIndex::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query(&index, UpdateMode::Lazy, counting(&calls, vec![]));

        let pending = query.value();
        let again = query.refresh();
        assert_eq!(pending.await.expect("value"), again.await.expect("value"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_settles_without_retry() {
        let index = Arc::new(CacheIndex::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query(&index, UpdateMode::Lazy, failing(&calls));

        let err = query.value().await.expect_err("resolver fails");
        assert!(matches!(err, QueryError::Resolver(_)));
        assert!(!query.loading());
        assert!(!query.is_dirty());
        assert_eq!(query.status(), QueryStatus::Failed);

        assert!(query.value().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(query.refresh().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn latest_survives_failure() {
        let index = Arc::new(CacheIndex::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let resolver: ResolverFn<usize> = Arc::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Ok(Resolved::new(7).depends_on(key_path!["root"]))
                } else {
                    Err(QueryError::resolver("gone"))
                }
            }
            .boxed()
        });
        let query = query(&index, UpdateMode::Lazy, resolver);

        assert_eq!(query.value().await.expect("value"), 7);
        assert!(query.refresh().await.is_err());

        assert_eq!(query.latest(), Some(7));
        // Failed evaluations keep the previous subscriptions.
        assert!(index.keys_for(query.id()).contains(&key_path!["root"].canonical()));
    }

    #[tokio::test]
    async fn resolver_may_observe_its_own_query() {
        let index = Arc::new(CacheIndex::new());
        let slot: Arc<OnceLock<Query<usize>>> = Arc::new(OnceLock::new());
        let seen = Arc::clone(&slot);
        let resolver: ResolverFn<usize> = Arc::new(move || {
            let loading = seen.get().is_some_and(Query::loading);
            async move { Ok(Resolved::new(usize::from(loading))) }.boxed()
        });
        let query = query(&index, UpdateMode::Lazy, resolver);
        slot.set(query.clone()).expect("slot is empty");

        assert_eq!(query.value().await.expect("value"), 1);
        assert_eq!(query.status(), QueryStatus::Settled);
    }

    #[tokio::test]
    async fn synchronous_panic_clears_loading() {
        let index = Arc::new(CacheIndex::new());
        let resolver: ResolverFn<usize> =
            Arc::new(|| -> Resolving<usize> { panic!("bad resolver") });
        let query = query(&index, UpdateMode::Eager, resolver);

        let err = query.value().await.expect_err("panic settles to an error");
        assert!(matches!(err, QueryError::Panicked(_)));
        assert!(!query.loading());
        assert_eq!(query.status(), QueryStatus::Failed);
    }

    #[tokio::test]
    async fn dropped_engine_index_skips_subscription() {
        let index = Arc::new(CacheIndex::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = query(
            &index,
            UpdateMode::Lazy,
            counting(&calls, vec![key_path!["a"]]),
        );
        drop(index);

        assert_eq!(query.value().await.expect("value"), 0);
    }
}
