//! Per-queue set of deleted item keys.

use std::sync::Arc;

use crate::error::Result;
use crate::model::{ItemKey, QueueName};
use crate::store::ViewStore;

use super::{ResultStream, paged};

#[derive(Clone)]
pub struct TombstoneStore {
    store: Arc<dyn ViewStore>,
}

impl TombstoneStore {
    pub fn new(store: Arc<dyn ViewStore>) -> Self {
        Self { store }
    }

    /// Marking an already deleted key is a no-op.
    pub async fn mark_deleted(&self, queue: &QueueName, key: ItemKey) -> Result<()> {
        self.store.put_tombstone(queue, key).await
    }

    pub async fn is_deleted(&self, queue: &QueueName, key: ItemKey) -> Result<bool> {
        self.store.has_tombstone(queue, key).await
    }

    /// Lazily page through every tombstoned key of `queue`.
    pub fn scan(&self, queue: &QueueName, page_size: usize) -> ResultStream<ItemKey> {
        let store = Arc::clone(&self.store);
        let queue = queue.clone();
        paged(None, move |from| {
            let store = Arc::clone(&store);
            let queue = queue.clone();
            async move { store.scan_tombstones(&queue, from.as_ref(), page_size).await }
        })
    }
}
