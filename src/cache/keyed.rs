//! Generic keyed cache with per-entry locking and opt-in refresh/expiry.
//!
//! # Locking
//!
//! Two levels:
//!
//! - the slot map, a moka cache keyed on the entry key. Lookups and inserts
//!   are atomic per key; nothing awaits while touching it.
//! - one async mutex per key ("slot"), held while an entry is created,
//!   refreshed, or read by a caller through a [`CacheGuard`].
//!
//! Creation runs under the slot lock only: misses on different keys proceed
//! concurrently, while concurrent misses on the same key queue on the slot
//! and only the first one creates the entry.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use moka::ops::compute::Op;
use moka::sync::Cache;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::telemetry;
use crate::{AgentError, Result};

/// A value stored in a [`KeyedCache`].
///
/// Capabilities are opt-in: override [`as_expirable`](Self::as_expirable)
/// and/or [`as_refreshable`](Self::as_refreshable) to return `Some(self)`.
pub trait CacheItem: Send + Sync + 'static {
    /// Stable key under which the item is stored.
    fn key(&self) -> &str;

    fn as_expirable(&self) -> Option<&dyn Expirable> {
        None
    }

    fn as_refreshable(&self) -> Option<&dyn Refreshable> {
        None
    }

    /// For downcasting through [`CacheGuard::downcast_ref`].
    fn as_any(&self) -> &dyn Any;
}

/// An item that becomes a cache miss once expired.
pub trait Expirable: Send + Sync {
    fn is_expired(&self) -> bool;
}

/// An item whose contents are (re)loaded from an upstream source.
///
/// Both methods are only ever invoked by the cache with the item's slot lock
/// held, so at most one refresh per key is in flight.
#[async_trait]
pub trait Refreshable: Send + Sync {
    /// Reload unconditionally.
    async fn refresh(&self) -> Result<()>;

    /// Reload only if the item's policy says so. Returns whether it did.
    async fn refresh_if_needed(&self) -> Result<bool>;
}

type ItemRef = Arc<dyn CacheItem>;

struct Slot {
    item: Arc<Mutex<Option<ItemRef>>>,
    populated: AtomicBool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            item: Arc::new(Mutex::new(None)),
            populated: AtomicBool::new(false),
        }
    }

    fn filled(item: ItemRef) -> Self {
        Self {
            item: Arc::new(Mutex::new(Some(item))),
            populated: AtomicBool::new(true),
        }
    }

    fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }
}

/// Exclusive access to a cached item.
///
/// The item's slot stays locked until the guard is dropped; drop it as soon
/// as you are done reading.
pub struct CacheGuard {
    item: ItemRef,
    _lock: OwnedMutexGuard<Option<ItemRef>>,
}

impl CacheGuard {
    pub fn item(&self) -> &ItemRef {
        &self.item
    }

    /// The item as its concrete type, if it is a `T`.
    pub fn downcast_ref<T: CacheItem>(&self) -> Option<&T> {
        self.item.as_any().downcast_ref::<T>()
    }
}

impl std::fmt::Debug for CacheGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGuard")
            .field("key", &self.item.key())
            .finish()
    }
}

/// Thread-safe string-keyed store of [`CacheItem`]s.
///
/// Unbounded: entries leave only through [`delete`](Self::delete), a failed
/// create, or lazy expiry on lookup. There is no background sweep.
pub struct KeyedCache {
    slots: Cache<String, Arc<Slot>>,
}

impl Default for KeyedCache {
    fn default() -> Self {
        Self {
            slots: Cache::builder().build(),
        }
    }
}

impl KeyedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `item` under its key, replacing any existing entry.
    pub fn set(&self, item: ItemRef) -> Result<()> {
        let key = item.key();
        if key.is_empty() {
            return Err(AgentError::InvalidInput("cache item key is empty".to_string()));
        }
        let key = key.to_string();
        self.slots.insert(key, Arc::new(Slot::filled(item)));
        Ok(())
    }

    /// Whether a populated entry exists for `key`. Does not check expiry.
    pub fn has(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.is_populated())
    }

    /// Keys of all populated entries, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_populated())
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove the entry for `key`, if any.
    pub fn delete(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(AgentError::InvalidInput("cache key is empty".to_string()));
        }
        self.slots.invalidate(key);
        Ok(())
    }

    /// Return the entry for `key`, creating it with `create` on a miss.
    ///
    /// Refreshable entries get [`Refreshable::refresh_if_needed`] before the
    /// guard is returned. If creation fails nothing is cached; if the refresh
    /// fails the created entry stays so the next call retries the fetch
    /// rather than the create.
    pub async fn get_or_create<F, Fut>(&self, key: &str, create: F) -> Result<CacheGuard>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ItemRef>>,
    {
        if key.is_empty() {
            return Err(AgentError::InvalidInput("cache key is empty".to_string()));
        }

        let (slot, mut guard) = loop {
            let slot = self
                .slots
                .entry_by_ref(key)
                .or_insert_with(|| Arc::new(Slot::empty()))
                .into_value();
            let guard = Arc::clone(&slot.item).lock_owned().await;
            // Replaced or deleted while we waited; start over on the live slot.
            if self.is_current(key, &slot) {
                break (slot, guard);
            }
        };

        let cached = guard
            .as_ref()
            .filter(|item| !is_expired(item))
            .cloned();

        let item = match cached {
            Some(item) => {
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "key" => key.to_owned())
                    .increment(1);
                item
            }
            None => {
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "key" => key.to_owned())
                    .increment(1);
                if guard.is_some() {
                    debug!(key, "cache entry expired");
                }
                *guard = None;
                slot.populated.store(false, Ordering::Release);

                let item = match create().await {
                    Ok(item) => item,
                    Err(e) => {
                        drop(guard);
                        self.remove_slot(key, &slot);
                        return Err(e);
                    }
                };
                if item.key() != key {
                    drop(guard);
                    self.remove_slot(key, &slot);
                    return Err(AgentError::InvalidInput(format!(
                        "created item key {:?} does not match {key:?}",
                        item.key()
                    )));
                }
                debug!(key, "cache entry created");
                *guard = Some(Arc::clone(&item));
                slot.populated.store(true, Ordering::Release);
                item
            }
        };

        if let Some(refreshable) = item.as_refreshable() {
            refreshable.refresh_if_needed().await?;
        }

        Ok(CacheGuard {
            item,
            _lock: guard,
        })
    }

    /// Return the entry for `key`, or [`AgentError::KeyNotFound`].
    pub async fn get(&self, key: &str) -> Result<CacheGuard> {
        if key.is_empty() {
            return Err(AgentError::InvalidInput("cache key is empty".to_string()));
        }

        let (slot, guard) = self.lock_existing(key).await?;
        let Some(item) = guard.as_ref().cloned() else {
            return Err(AgentError::KeyNotFound(key.to_string()));
        };
        if is_expired(&item) {
            debug!(key, "cache entry expired");
            drop(guard);
            self.remove_slot(key, &slot);
            return Err(AgentError::KeyNotFound(key.to_string()));
        }

        if let Some(refreshable) = item.as_refreshable() {
            refreshable.refresh_if_needed().await?;
        }

        Ok(CacheGuard {
            item,
            _lock: guard,
        })
    }

    /// Force a refresh of the named entries, or of every entry when `keys`
    /// is empty. Stops at the first error.
    pub async fn refresh(&self, keys: &[&str]) -> Result<()> {
        let keys: Vec<String> = if keys.is_empty() {
            self.keys()
        } else {
            keys.iter().map(|k| k.to_string()).collect()
        };

        for key in keys {
            let (_slot, guard) = self.lock_existing(&key).await?;
            let Some(item) = guard.as_ref() else {
                return Err(AgentError::KeyNotFound(key));
            };
            if let Some(refreshable) = item.as_refreshable() {
                debug!(key = %key, "forcing cache refresh");
                refreshable.refresh().await?;
            }
        }
        Ok(())
    }

    async fn lock_existing(&self, key: &str) -> Result<(Arc<Slot>, OwnedMutexGuard<Option<ItemRef>>)> {
        loop {
            let slot = self
                .slots
                .get(key)
                .ok_or_else(|| AgentError::KeyNotFound(key.to_string()))?;
            let guard = Arc::clone(&slot.item).lock_owned().await;
            if self.is_current(key, &slot) {
                return Ok((slot, guard));
            }
        }
    }

    fn is_current(&self, key: &str, slot: &Arc<Slot>) -> bool {
        self.slots
            .get(key)
            .is_some_and(|live| Arc::ptr_eq(&live, slot))
    }

    /// Drop `slot` from the map unless another slot was installed meanwhile.
    fn remove_slot(&self, key: &str, slot: &Arc<Slot>) {
        let _ = self.slots.entry_by_ref(key).and_compute_with(|entry| match entry {
            Some(entry) if Arc::ptr_eq(entry.value(), slot) => Op::Remove,
            _ => Op::Nop,
        });
    }
}

fn is_expired(item: &ItemRef) -> bool {
    item.as_expirable().is_some_and(|e| e.is_expired())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Plain {
        key: String,
        value: u32,
    }

    impl Plain {
        fn item(key: &str, value: u32) -> ItemRef {
            Arc::new(Self {
                key: key.to_string(),
                value,
            })
        }
    }

    impl CacheItem for Plain {
        fn key(&self) -> &str {
            &self.key
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Expiring {
        key: String,
        expired: AtomicBool,
    }

    impl CacheItem for Expiring {
        fn key(&self) -> &str {
            &self.key
        }

        fn as_expirable(&self) -> Option<&dyn Expirable> {
            Some(self)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl Expirable for Expiring {
        fn is_expired(&self) -> bool {
            self.expired.load(Ordering::SeqCst)
        }
    }

    struct Counting {
        key: String,
        refreshes: AtomicU32,
        fail: AtomicBool,
        needed: AtomicBool,
    }

    impl Counting {
        fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                refreshes: AtomicU32::new(0),
                fail: AtomicBool::new(false),
                needed: AtomicBool::new(true),
            })
        }
    }

    impl CacheItem for Counting {
        fn key(&self) -> &str {
            &self.key
        }

        fn as_refreshable(&self) -> Option<&dyn Refreshable> {
            Some(self)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[async_trait]
    impl Refreshable for Counting {
        async fn refresh(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::Upstream("refresh failed".to_string()));
            }
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.needed.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn refresh_if_needed(&self) -> Result<bool> {
            if !self.needed.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.refresh().await.map(|()| true)
        }
    }

    #[test]
    fn set_rejects_empty_key() {
        let cache = KeyedCache::new();
        let err = cache.set(Plain::item("", 1)).unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[test]
    fn set_has_keys_delete() {
        let cache = KeyedCache::new();
        cache.set(Plain::item("b", 1)).unwrap();
        cache.set(Plain::item("a", 2)).unwrap();
        assert!(cache.has("a"));
        assert!(!cache.has("c"));
        assert_eq!(cache.keys(), vec!["a", "b"]);

        cache.delete("a").unwrap();
        assert!(!cache.has("a"));
        assert_eq!(cache.keys(), vec!["b"]);
        assert!(cache.delete("").is_err());
    }

    #[tokio::test]
    async fn get_missing_key() {
        let cache = KeyedCache::new();
        let err = cache.get("nope").await.unwrap_err();
        assert!(matches!(err, AgentError::KeyNotFound(k) if k == "nope"));
    }

    #[tokio::test]
    async fn get_returns_set_item() {
        let cache = KeyedCache::new();
        cache.set(Plain::item("k", 42)).unwrap();
        let guard = cache.get("k").await.unwrap();
        assert_eq!(guard.downcast_ref::<Plain>().unwrap().value, 42);
    }

    #[tokio::test]
    async fn get_or_create_hit_does_not_create() {
        let cache = KeyedCache::new();
        cache.set(Plain::item("k", 1)).unwrap();
        let guard = cache
            .get_or_create("k", || async { panic!("should not create") })
            .await
            .unwrap();
        assert_eq!(guard.downcast_ref::<Plain>().unwrap().value, 1);
    }

    #[tokio::test]
    async fn failed_create_leaves_nothing_behind() {
        let cache = KeyedCache::new();
        let err = cache
            .get_or_create("k", || async { Err(AgentError::Upstream("down".into())) })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!cache.has("k"));
        assert!(cache.keys().is_empty());

        let guard = cache
            .get_or_create("k", || async { Ok(Plain::item("k", 7)) })
            .await
            .unwrap();
        assert_eq!(guard.downcast_ref::<Plain>().unwrap().value, 7);
    }

    #[tokio::test]
    async fn mismatched_created_key_rejected() {
        let cache = KeyedCache::new();
        let err = cache
            .get_or_create("k", || async { Ok(Plain::item("other", 1)) })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
        assert!(!cache.has("k"));
    }

    #[tokio::test]
    async fn expired_entry_is_recreated() {
        let cache = KeyedCache::new();
        let first = Arc::new(Expiring {
            key: "k".into(),
            expired: AtomicBool::new(false),
        });
        cache.set(first.clone()).unwrap();
        first.expired.store(true, Ordering::SeqCst);

        let guard = cache
            .get_or_create("k", || async {
                Ok(Arc::new(Expiring {
                    key: "k".into(),
                    expired: AtomicBool::new(false),
                }) as ItemRef)
            })
            .await
            .unwrap();
        let first_ref: ItemRef = first;
        assert!(!Arc::ptr_eq(guard.item(), &first_ref));
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_on_get() {
        let cache = KeyedCache::new();
        cache
            .set(Arc::new(Expiring {
                key: "k".into(),
                expired: AtomicBool::new(true),
            }))
            .unwrap();
        assert!(cache.has("k"));
        assert!(cache.get("k").await.unwrap_err().is_not_found());
        assert!(!cache.has("k"));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_created_entry() {
        let cache = KeyedCache::new();
        let item = Counting::new("k");
        item.fail.store(true, Ordering::SeqCst);

        let created = item.clone();
        let err = cache
            .get_or_create("k", move || async move { Ok(created as ItemRef) })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(cache.has("k"));

        // Next call retries the fetch on the existing entry.
        item.fail.store(false, Ordering::SeqCst);
        cache
            .get_or_create("k", || async { panic!("should not create again") })
            .await
            .unwrap();
        assert_eq!(item.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_if_needed_skipped_when_fresh() {
        let cache = KeyedCache::new();
        let item = Counting::new("k");
        item.needed.store(false, Ordering::SeqCst);
        cache.set(item.clone()).unwrap();

        for _ in 0..3 {
            cache.get("k").await.unwrap();
        }
        assert_eq!(item.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn forced_refresh_all_and_named() {
        let cache = KeyedCache::new();
        let a = Counting::new("a");
        let b = Counting::new("b");
        cache.set(a.clone()).unwrap();
        cache.set(b.clone()).unwrap();
        cache.set(Plain::item("plain", 0)).unwrap();

        cache.refresh(&[]).await.unwrap();
        assert_eq!(a.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(b.refreshes.load(Ordering::SeqCst), 1);

        cache.refresh(&["b"]).await.unwrap();
        assert_eq!(a.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(b.refreshes.load(Ordering::SeqCst), 2);

        assert!(cache.refresh(&["missing"]).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn forced_refresh_stops_at_first_error() {
        let cache = KeyedCache::new();
        let a = Counting::new("a");
        let b = Counting::new("b");
        a.fail.store(true, Ordering::SeqCst);
        cache.set(a.clone()).unwrap();
        cache.set(b.clone()).unwrap();

        assert!(cache.refresh(&[]).await.is_err());
        assert_eq!(b.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_create_once() {
        let cache = Arc::new(KeyedCache::new());
        let creates = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let creates = Arc::clone(&creates);
            tasks.push(tokio::spawn(async move {
                let guard = cache
                    .get_or_create("shared", || async move {
                        creates.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Plain::item("shared", 1))
                    })
                    .await
                    .unwrap();
                Arc::clone(guard.item())
            }));
        }

        let mut items = Vec::new();
        for task in tasks {
            items.push(task.await.unwrap());
        }
        assert_eq!(creates.load(Ordering::SeqCst), 1);
        assert!(items.iter().all(|item| Arc::ptr_eq(item, &items[0])));
    }

    #[tokio::test]
    async fn waiter_moves_to_slot_installed_after_delete() {
        let cache = Arc::new(KeyedCache::new());
        cache.set(Plain::item("k", 1)).unwrap();
        let held = cache.get("k").await.unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let guard = cache
                    .get_or_create("k", || async { Ok(Plain::item("k", 2)) })
                    .await
                    .unwrap();
                guard.downcast_ref::<Plain>().unwrap().value
            })
        };
        tokio::task::yield_now().await;

        cache.delete("k").unwrap();
        drop(held);
        assert_eq!(waiter.await.unwrap(), 2);
        assert!(cache.has("k"));
    }

    #[tokio::test]
    async fn failed_create_keeps_concurrently_set_entry() {
        let cache = Arc::new(KeyedCache::new());
        let (fail_tx, fail_rx) = tokio::sync::oneshot::channel::<()>();

        let creating = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_create("k", || async move {
                        let _ = fail_rx.await;
                        Err(AgentError::Upstream("down".into()))
                    })
                    .await
                    .map(|_| ())
            })
        };
        tokio::task::yield_now().await;

        cache.set(Plain::item("k", 9)).unwrap();
        fail_tx.send(()).unwrap();
        assert!(creating.await.unwrap().is_err());

        let guard = cache.get("k").await.unwrap();
        assert_eq!(guard.downcast_ref::<Plain>().unwrap().value, 9);
    }

    #[tokio::test]
    async fn misses_on_different_keys_do_not_serialize() {
        let cache = Arc::new(KeyedCache::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_create("slow", || async move {
                        let _ = release_rx.await;
                        Ok(Plain::item("slow", 1))
                    })
                    .await
                    .map(|_| ())
            })
        };
        tokio::task::yield_now().await;

        // Completes while "slow" is still being created.
        cache
            .get_or_create("fast", || async { Ok(Plain::item("fast", 2)) })
            .await
            .unwrap();
        assert!(cache.has("fast"));
        assert!(!cache.has("slow"));

        release_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert!(cache.has("slow"));
    }
}
