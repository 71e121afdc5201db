//! An in-memory implementation of the `raftkv::KvStore` trait.
//!
//! Useful for testing and for ephemeral deployments. Batches apply
//! atomically under a write lock; the `durable` flag is accepted and
//! ignored, since nothing here survives the process anyway.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use raftkv::mvcc::Writes;
use raftkv::storage::KvSnapshot;
use raftkv::storage::KvStore;
use tokio::sync::RwLock;

/// An in-memory key/value store.
#[derive(Debug, Default)]
pub struct MemStore {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The number of keys currently stored; handy in tests.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

fn in_range(key: &[u8], start: &[u8], end: Option<&[u8]>) -> bool {
    key >= start
        && match end {
            None => true,
            Some(end) => key < end,
        }
}

#[async_trait]
impl KvStore for MemStore {
    async fn snapshot(&self) -> Result<Box<dyn KvSnapshot>> {
        let data = self.data.read().await.clone();
        Ok(Box::new(MemSnapshot { data }))
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn mutate(&self, writes: Writes, _durable: bool) -> Result<()> {
        let mut data = self.data.write().await;
        for (start, end) in writes.removes().iter() {
            let doomed: Vec<Bytes> = data
                .range::<[u8], _>((Bound::Included(start.as_ref()), Bound::Unbounded))
                .take_while(|(key, _)| in_range(key, start, end.map(|e| e.as_ref())))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                data.remove(&key);
            }
        }
        for (key, value) in writes.puts() {
            data.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn remove_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<()> {
        let mut writes = Writes::new();
        writes.remove_range(start, end);
        self.mutate(writes, false).await
    }
}

/// A point-in-time copy of the store contents.
pub struct MemSnapshot {
    data: BTreeMap<Bytes, Bytes>,
}

impl KvSnapshot for MemSnapshot {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    fn iter_range<'a>(
        &'a self,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + Send + 'a> {
        let start = Bytes::copy_from_slice(start);
        let end = end.map(Bytes::copy_from_slice);
        Box::new(
            self.data
                .range::<[u8], _>((Bound::Included(start.as_ref()), Bound::Unbounded))
                .take_while(move |(key, _)| match &end {
                    None => true,
                    Some(end) => key.as_ref() < end.as_ref(),
                })
                .map(|(key, value)| (key.clone(), value.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn mutate_applies_removes_before_puts() {
        let store = MemStore::new();
        let mut seed = Writes::new();
        seed.put(b"a", b("1"));
        seed.put(b"b", b("2"));
        seed.put(b"c", b("3"));
        store.mutate(seed, true).await.unwrap();

        // A batch that clears a range and re-puts one key inside it.
        let mut batch = Writes::new();
        batch.remove_range(b"a", Some(b"c"));
        batch.put(b"b", b("new"));
        store.mutate(batch, true).await.unwrap();

        assert_eq!(store.get(b"a").await.unwrap(), None);
        assert_eq!(store.get(b"b").await.unwrap(), Some(b("new")));
        assert_eq!(store.get(b"c").await.unwrap(), Some(b("3")));
    }

    #[tokio::test]
    async fn snapshot_is_isolated_from_later_writes() {
        let store = MemStore::new();
        let mut seed = Writes::new();
        seed.put(b"k", b("old"));
        store.mutate(seed, true).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();

        let mut update = Writes::new();
        update.put(b"k", b("new"));
        store.mutate(update, true).await.unwrap();

        assert_eq!(snapshot.get(b"k"), Some(b("old")));
        assert_eq!(store.get(b"k").await.unwrap(), Some(b("new")));
    }

    #[tokio::test]
    async fn range_iteration_in_key_order() {
        let store = MemStore::new();
        let mut seed = Writes::new();
        for key in ["a", "b", "c", "d"] {
            seed.put(key.as_bytes(), b(key));
        }
        store.mutate(seed, true).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let keys: Vec<Bytes> = snapshot.iter_range(b"b", Some(b"d")).map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b("b"), b("c")]);

        let all: Vec<Bytes> = snapshot.iter_range(b"", None).map(|(k, _)| k).collect();
        assert_eq!(all.len(), 4);
    }
}
