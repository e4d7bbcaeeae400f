//! Concurrent map with one async lock per key.
//!
//! A key's lock is created the first time the key is touched and reused after
//! that, so unrelated keys never contend. Holding a key's guard serializes all
//! work on that key, including broker calls made while it is held.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct SafeMap<K, V> {
    inner: DashMap<K, Arc<Mutex<V>>>,
}

impl<K, V> Default for SafeMap<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SafeMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Current value for `key`, if the key exists.
    pub async fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        // Clone the slot out so no shard lock is held across the await.
        let slot = self.inner.get(key).map(|s| Arc::clone(s.value()))?;
        let value = slot.lock().await.clone();
        Some(value)
    }

    /// Replace the value for `key`, reusing its lock when the key exists.
    pub async fn set(&self, key: K, value: V) {
        let slot = match self.inner.entry(key) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => {
                e.insert(Arc::new(Mutex::new(value)));
                return;
            }
        };
        *slot.lock().await = value;
    }

    pub fn remove(&self, key: &K) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }
}

impl<K, V> SafeMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    fn slot(&self, key: &K) -> Arc<Mutex<V>> {
        if let Some(slot) = self.inner.get(key) {
            return Arc::clone(slot.value());
        }
        let slot = self
            .inner
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(V::default())));
        Arc::clone(slot.value())
    }

    /// Lock `key`, creating it with the default value on first use.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<V> {
        self.slot(key).lock_owned().await
    }

    /// Mutate the value for `key` under its lock.
    pub async fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> R {
        let mut guard = self.lock(key).await;
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lazy_creation_and_reuse() {
        let map: SafeMap<String, u32> = SafeMap::new();
        assert_eq!(map.get(&"a".to_string()).await, None);

        map.update(&"a".to_string(), |v| *v += 2).await;
        map.update(&"a".to_string(), |v| *v += 3).await;
        assert_eq!(map.get(&"a".to_string()).await, Some(5));

        map.set("b".to_string(), 7).await;
        map.set("b".to_string(), 8).await;
        assert_eq!(map.get(&"b".to_string()).await, Some(8));
        let mut keys = map.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        assert!(map.remove(&"a".to_string()));
        assert!(!map.remove(&"a".to_string()));
        assert_eq!(map.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn test_same_key_serializes() {
        let map: Arc<SafeMap<String, Vec<u32>>> = Arc::new(SafeMap::new());
        let key = "BTCUSDT".to_string();

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let map = Arc::clone(&map);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = map.lock(&key).await;
                let before = guard.len();
                tokio::time::sleep(Duration::from_millis(2)).await;
                guard.push(i);
                assert_eq!(guard.len(), before + 1);
            }));
        }
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        assert_eq!(map.get(&key).await.map(|v| v.len()), Some(8));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let map: SafeMap<String, u32> = SafeMap::new();
        let _held = map.lock(&"BTCUSDT".to_string()).await;

        let other = tokio::time::timeout(Duration::from_millis(50), map.lock(&"ETHUSDT".to_string())).await;
        assert!(other.is_ok());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        use tokio_test::{assert_pending, assert_ready, task};

        let map: SafeMap<String, u32> = SafeMap::new();
        let key = "BTCUSDT".to_string();
        let held = tokio_test::block_on(map.lock(&key));

        let mut waiter = task::spawn(map.lock(&key));
        assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        let mut guard = assert_ready!(waiter.poll());
        *guard += 1;
        drop(guard);

        assert_eq!(tokio_test::block_on(map.get(&key)), Some(1));
    }
}
