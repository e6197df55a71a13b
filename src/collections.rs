//! Collections resolver: maps `(scope, collection)` to numeric collection
//! ids, with a bounded cache and single-flight resolution

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::Result;

#[async_trait::async_trait]
pub trait CollectionIdFetcher: Send + Sync {
    async fn fetch(&self, scope: &str, collection: &str) -> Result<u32>;
}

struct InFlight {
    notify: Arc<Notify>,
    result: std::sync::Mutex<Option<Result<u32>>>,
}

struct CacheState {
    entries: HashMap<(String, String), u32>,
    in_flight: HashMap<(String, String), Arc<InFlight>>,
    capacity: usize,
    insertion_order: Vec<(String, String)>,
}

/// Bounded, single-flight collection-id cache. At most one server request
/// is outstanding per `(scope, collection)` key at any time; concurrent
/// callers for the same key share the one in-flight lookup's result
/// so concurrent lookups for the same key never issue duplicate requests.
pub struct CollectionsResolver {
    state: Mutex<CacheState>,
    fetcher: Arc<dyn CollectionIdFetcher>,
}

impl CollectionsResolver {
    pub fn new(fetcher: Arc<dyn CollectionIdFetcher>, capacity: usize) -> Self {
        CollectionsResolver {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                capacity,
                insertion_order: Vec::new(),
            }),
            fetcher,
        }
    }

    pub async fn resolve(&self, scope: &str, collection: &str) -> Result<u32> {
        let key = (scope.to_string(), collection.to_string());

        loop {
            let mut guard = self.state.lock().await;
            if let Some(id) = guard.entries.get(&key) {
                return Ok(*id);
            }
            if let Some(inflight) = guard.in_flight.get(&key).cloned() {
                drop(guard);
                inflight.notify.notified().await;
                if let Some(result) = inflight.result.lock().unwrap().clone() {
                    return result;
                }
                continue;
            }

            let inflight = Arc::new(InFlight {
                notify: Arc::new(Notify::new()),
                result: std::sync::Mutex::new(None),
            });
            guard.in_flight.insert(key.clone(), inflight.clone());
            drop(guard);

            let fetched = self.fetcher.fetch(scope, collection).await;
            *inflight.result.lock().unwrap() = Some(fetched.clone());

            let mut guard = self.state.lock().await;
            guard.in_flight.remove(&key);
            if let Ok(id) = &fetched {
                self.insert_bounded(&mut guard, key.clone(), *id);
            }
            inflight.notify.notify_waiters();
            return fetched;
        }
    }

    fn insert_bounded(&self, guard: &mut CacheState, key: (String, String), id: u32) {
        if !guard.entries.contains_key(&key) {
            guard.insertion_order.push(key.clone());
            if guard.insertion_order.len() > guard.capacity {
                let oldest = guard.insertion_order.remove(0);
                guard.entries.remove(&oldest);
            }
        }
        guard.entries.insert(key, id);
    }

    /// Invalidated on a server-signaled "unknown collection" error
    /// e.g. after a server-signaled "unknown collection" response.
    pub async fn invalidate(&self, scope: &str, collection: &str) {
        let mut guard = self.state.lock().await;
        let key = (scope.to_string(), collection.to_string());
        guard.entries.remove(&key);
        guard.insertion_order.retain(|k| k != &key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFetcher {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl CollectionIdFetcher for CountingFetcher {
        async fn fetch(&self, _scope: &str, _collection: &str) -> Result<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(7)
        }
    }

    #[tokio::test]
    async fn concurrent_lookups_single_flight_to_one_server_call() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });
        let resolver = Arc::new(CollectionsResolver::new(fetcher.clone(), 16));

        let r1 = resolver.clone();
        let r2 = resolver.clone();
        let (a, b) = tokio::join!(
            r1.resolve("inventory", "airline"),
            r2.resolve("inventory", "airline")
        );

        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_lookup() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });
        let resolver = CollectionsResolver::new(fetcher.clone(), 16);
        resolver.resolve("s", "c").await.unwrap();
        resolver.invalidate("s", "c").await;
        resolver.resolve("s", "c").await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_evicts_oldest_entry_past_capacity() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });
        let resolver = CollectionsResolver::new(fetcher.clone(), 1);
        resolver.resolve("s", "a").await.unwrap();
        resolver.resolve("s", "b").await.unwrap();
        // "a" should have been evicted, forcing a second fetch.
        resolver.resolve("s", "a").await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }
}
