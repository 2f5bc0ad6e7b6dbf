//! In-process storage engine.
//!
//! Same contract as the Postgres store, backed by ordered maps. Used by the
//! test suite and by tools that want a throwaway view.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{ContinuationToken, Page, SliceCondition, ViewStore};
use crate::error::{Error, Result};
use crate::model::{EnqueuedItem, ItemKey, Partition, QueueName, Slice};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    items: HashMap<Partition, BTreeMap<ItemKey, EnqueuedItem>>,
    tombstones: HashMap<QueueName, BTreeSet<ItemKey>>,
    browse_start: HashMap<QueueName, Slice>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }
}

fn lower_bound(from: Option<&ContinuationToken>) -> Result<Bound<ItemKey>> {
    Ok(match from {
        Some(token) => Bound::Excluded(token.last_key()?),
        None => Bound::Unbounded,
    })
}

#[async_trait]
impl ViewStore for MemoryStore {
    async fn append_item(&self, item: &EnqueuedItem) -> Result<()> {
        let mut state = self.write()?;
        state
            .items
            .entry(item.partition())
            .or_default()
            .entry(item.key)
            .or_insert_with(|| item.clone());
        Ok(())
    }

    async fn scan_items(
        &self,
        partition: &Partition,
        from: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page<EnqueuedItem>> {
        let lower = lower_bound(from)?;
        let state = self.read()?;
        let Some(items) = state.items.get(partition) else {
            return Ok(Page::empty());
        };
        let rows: Vec<EnqueuedItem> = items
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect();
        Ok(Page::from_rows(rows, limit, |item| item.key))
    }

    async fn has_items(&self, partition: &Partition) -> Result<bool> {
        let state = self.read()?;
        Ok(state
            .items
            .get(partition)
            .is_some_and(|items| !items.is_empty()))
    }

    async fn put_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<()> {
        let mut state = self.write()?;
        state.tombstones.entry(queue.clone()).or_default().insert(key);
        Ok(())
    }

    async fn has_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<bool> {
        let state = self.read()?;
        Ok(state
            .tombstones
            .get(queue)
            .is_some_and(|keys| keys.contains(&key)))
    }

    async fn scan_tombstones(
        &self,
        queue: &QueueName,
        from: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page<ItemKey>> {
        let lower = lower_bound(from)?;
        let state = self.read()?;
        let Some(keys) = state.tombstones.get(queue) else {
            return Ok(Page::empty());
        };
        let rows: Vec<ItemKey> = keys
            .range((lower, Bound::Unbounded))
            .take(limit)
            .copied()
            .collect();
        Ok(Page::from_rows(rows, limit, |key| *key))
    }

    async fn read_browse_start(&self, queue: &QueueName) -> Result<Option<Slice>> {
        let state = self.read()?;
        Ok(state.browse_start.get(queue).copied())
    }

    async fn compare_and_swap_browse_start(
        &self,
        queue: &QueueName,
        condition: SliceCondition,
        new: Slice,
    ) -> Result<bool> {
        let mut state = self.write()?;
        let current = state.browse_start.get(queue).copied();
        let applies = match (condition, current) {
            (SliceCondition::Absent, None) => true,
            (SliceCondition::Below, Some(current)) => current < new,
            _ => false,
        };
        if applies {
            state.browse_start.insert(queue.clone(), new);
        }
        Ok(applies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketId, ContentRef};
    use chrono::Utc;

    fn item(queue: &str, name: &str) -> EnqueuedItem {
        EnqueuedItem {
            queue: QueueName::from(queue),
            slice: Slice(10),
            bucket: BucketId(0),
            key: ItemKey::new(),
            enqueued_at: Utc::now(),
            name: name.to_string(),
            sender: None,
            recipients: Vec::new(),
            header_ref: ContentRef::from("h"),
            body_ref: ContentRef::from("b"),
            attributes: Default::default(),
        }
    }

    #[tokio::test]
    async fn append_keeps_first_write() {
        let store = MemoryStore::new();
        let first = item("spool", "first");
        let mut second = first.clone();
        second.name = "second".to_string();

        store.append_item(&first).await.unwrap();
        store.append_item(&second).await.unwrap();

        let page = store.scan_items(&first.partition(), None, 10).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "first");
    }

    #[tokio::test]
    async fn conditional_write_only_moves_forward() {
        let store = MemoryStore::new();
        let queue = QueueName::from("spool");

        assert!(!store
            .compare_and_swap_browse_start(&queue, SliceCondition::Below, Slice(5))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap_browse_start(&queue, SliceCondition::Absent, Slice(5))
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap_browse_start(&queue, SliceCondition::Absent, Slice(1))
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap_browse_start(&queue, SliceCondition::Below, Slice(5))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap_browse_start(&queue, SliceCondition::Below, Slice(6))
            .await
            .unwrap());
        assert_eq!(store.read_browse_start(&queue).await.unwrap(), Some(Slice(6)));
    }

    #[tokio::test]
    async fn tombstones_are_scoped_per_queue() {
        let store = MemoryStore::new();
        let key = ItemKey::new();
        store
            .put_tombstone(&QueueName::from("a"), key)
            .await
            .unwrap();

        assert!(store.has_tombstone(&QueueName::from("a"), key).await.unwrap());
        assert!(!store.has_tombstone(&QueueName::from("b"), key).await.unwrap());
    }
}
