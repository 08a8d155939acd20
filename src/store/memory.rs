//! In-memory inventory store, the default for single-process pools.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{EntryStore, PoolEntry};
use crate::error::Result;

#[derive(Default)]
struct State {
    entries: HashMap<String, VecDeque<PoolEntry>>,
    pending: HashSet<String>,
}

/// FIFO per-partition inventory held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn push(&self, entry: PoolEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .entries
            .entry(entry.partition.clone())
            .or_default()
            .push_back(entry);
        Ok(())
    }

    async fn pop(&self, partition: &str, max_age: Duration) -> Result<Option<PoolEntry>> {
        let mut state = self.state.lock().unwrap();
        let Some(queue) = state.entries.get_mut(partition) else {
            return Ok(None);
        };
        let Some(entry) = queue.pop_front() else {
            return Ok(None);
        };
        if entry.age() > max_age {
            // Lazy expiration: the popped entry is stale, drop it and report
            // empty for this call. Younger entries stay for the next caller.
            debug!(partition, id = %entry.id, "discarding stale pool entry");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn count(&self, partition: &str) -> Result<usize> {
        let state = self.state.lock().unwrap();
        Ok(state.entries.get(partition).map_or(0, VecDeque::len))
    }

    async fn counts_by_partition(&self) -> Result<HashMap<String, usize>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .map(|(partition, queue)| (partition.clone(), queue.len()))
            .collect())
    }

    async fn pending(&self, partition: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().pending.contains(partition))
    }

    async fn set_pending(&self, partition: &str, pending: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if pending {
            state.pending.insert(partition.to_string());
        } else {
            state.pending.remove(partition);
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.state.lock().unwrap().pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: &str, partition: &str) -> PoolEntry {
        PoolEntry {
            id: id.to_string(),
            partition: partition.to_string(),
            data: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    fn aged_entry(id: &str, partition: &str, age: Duration) -> PoolEntry {
        PoolEntry {
            created_at: Utc::now() - chrono::Duration::from_std(age).unwrap(),
            ..entry(id, partition)
        }
    }

    #[tokio::test]
    async fn test_pop_is_fifo() {
        let store = MemoryStore::new();
        store.push(entry("a", "ord")).await.unwrap();
        store.push(entry("b", "ord")).await.unwrap();

        let first = store
            .pop("ord", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, "a");
        let second = store
            .pop("ord", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, "b");
        assert!(store.pop("ord", Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_is_destructive() {
        let store = MemoryStore::new();
        store.push(entry("a", "ord")).await.unwrap();
        assert_eq!(store.count("ord").await.unwrap(), 1);

        store.pop("ord", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.count("ord").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pop_discards_stale_entry() {
        let store = MemoryStore::new();
        store
            .push(aged_entry("old", "ord", Duration::from_secs(120)))
            .await
            .unwrap();

        // Store was non-empty, but the popped entry is past max age.
        let popped = store.pop("ord", Duration::from_secs(60)).await.unwrap();
        assert!(popped.is_none());
        assert_eq!(store.count("ord").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pop_discards_at_most_one() {
        let store = MemoryStore::new();
        store
            .push(aged_entry("old", "ord", Duration::from_secs(120)))
            .await
            .unwrap();
        store.push(entry("fresh", "ord")).await.unwrap();

        // The stale head is discarded and this call reports empty; the
        // fresh entry survives for the next caller.
        assert!(store.pop("ord", Duration::from_secs(60)).await.unwrap().is_none());
        let next = store
            .pop("ord", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, "fresh");
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let store = MemoryStore::new();
        store.push(entry("a", "ord")).await.unwrap();
        store.push(entry("b", "fra")).await.unwrap();

        assert_eq!(store.count("ord").await.unwrap(), 1);
        assert_eq!(store.count("fra").await.unwrap(), 1);
        assert!(store.pop("lhr", Duration::from_secs(60)).await.unwrap().is_none());

        let counts = store.counts_by_partition().await.unwrap();
        assert_eq!(counts.get("ord"), Some(&1));
        assert_eq!(counts.get("fra"), Some(&1));
    }

    #[tokio::test]
    async fn test_pending_flags() {
        let store = MemoryStore::new();
        assert!(!store.pending("ord").await.unwrap());
        assert_eq!(store.pending_count().await.unwrap(), 0);

        store.set_pending("ord", true).await.unwrap();
        store.set_pending("fra", true).await.unwrap();
        assert!(store.pending("ord").await.unwrap());
        assert_eq!(store.pending_count().await.unwrap(), 2);

        store.set_pending("ord", false).await.unwrap();
        assert!(!store.pending("ord").await.unwrap());
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }
}
