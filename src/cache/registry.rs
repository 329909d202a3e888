//! Dependency index.
//!
//! Tracks which queries are subscribed under each canonical key, enabling
//! invalidation fan-out when a key is invalidated.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use metrics::gauge;
use tracing::debug;

use super::keys::CanonicalKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";
const METRIC_INDEX_KEYS: &str = "depquery_index_keys";

/// Identity of a query within one engine.
///
/// Assigned from a monotonic counter at registration, so two queries built
/// from equal resolvers are still distinct subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(u64);

impl QueryId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Type-erased view of a query used for invalidation.
pub(crate) trait Subscriber: Send + Sync {
    fn id(&self) -> QueryId;

    /// Mark dirty without evaluating.
    fn flag(&self);

    /// Trigger evaluation and resolve once it has settled, whatever the outcome.
    fn settle(self: Arc<Self>) -> BoxFuture<'static, ()>;
}

/// Maps canonical keys to the ordered set of queries subscribed under them.
///
/// Each entry holds at most one subscription per [`QueryId`]. Insertion order
/// is kept and drives fan-out order within a key.
pub(crate) struct CacheIndex {
    entries: RwLock<HashMap<CanonicalKey, Vec<Arc<dyn Subscriber>>>>,
}

impl CacheIndex {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe `subscriber` under every key, skipping keys that already hold it.
    pub(crate) fn subscribe(&self, keys: &[CanonicalKey], subscriber: &Arc<dyn Subscriber>) {
        let id = subscriber.id();
        let mut entries = rw_write(&self.entries, SOURCE, "subscribe");

        for key in keys {
            let slot = entries.entry(key.clone()).or_default();
            if !slot.iter().any(|existing| existing.id() == id) {
                slot.push(Arc::clone(subscriber));
                debug!(query_id = %id, key = %key, "Query subscribed");
            }
        }

        gauge!(METRIC_INDEX_KEYS).set(entries.len() as f64);
    }

    /// Drop the subscription of `id` under each key, leaving other queries intact.
    pub(crate) fn unsubscribe(&self, id: QueryId, keys: &[CanonicalKey]) {
        if keys.is_empty() {
            return;
        }

        let mut entries = rw_write(&self.entries, SOURCE, "unsubscribe");

        for key in keys {
            let Some(slot) = entries.get_mut(key) else {
                continue;
            };
            slot.retain(|existing| existing.id() != id);
            debug!(query_id = %id, key = %key, "Query unsubscribed");
            if slot.is_empty() {
                entries.remove(key);
            }
        }

        gauge!(METRIC_INDEX_KEYS).set(entries.len() as f64);
    }

    /// Snapshot of the subscribers under `key`, in subscription order.
    pub(crate) fn subscribers(&self, key: &CanonicalKey) -> Vec<Arc<dyn Subscriber>> {
        rw_read(&self.entries, SOURCE, "subscribers")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every subscribed query, each listed once.
    pub(crate) fn all_subscribers(&self) -> Vec<Arc<dyn Subscriber>> {
        let entries = rw_read(&self.entries, SOURCE, "all_subscribers");
        let mut seen = HashSet::new();

        entries
            .values()
            .flatten()
            .filter(|subscriber| seen.insert(subscriber.id()))
            .cloned()
            .collect()
    }

    /// Keys under which `id` is currently subscribed.
    pub(crate) fn keys_for(&self, id: QueryId) -> HashSet<CanonicalKey> {
        rw_read(&self.entries, SOURCE, "keys_for")
            .iter()
            .filter(|(_, slot)| slot.iter().any(|subscriber| subscriber.id() == id))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of keys with at least one subscriber.
    pub(crate) fn key_count(&self) -> usize {
        rw_read(&self.entries, SOURCE, "key_count").len()
    }
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self::new()
    }
}
