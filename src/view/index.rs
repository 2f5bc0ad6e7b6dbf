//! Append-only index of enqueued items, partitioned by `(queue, slice, bucket)`.

use std::sync::Arc;

use crate::error::Result;
use crate::model::{EnqueuedItem, Partition};
use crate::store::{ContinuationToken, Page, ViewStore};

use super::{ResultStream, paged};

#[derive(Clone)]
pub struct EnqueuedItemIndex {
    store: Arc<dyn ViewStore>,
}

impl EnqueuedItemIndex {
    pub fn new(store: Arc<dyn ViewStore>) -> Self {
        Self { store }
    }

    /// Idempotent: re-appending the same key is a no-op.
    pub async fn append(&self, item: &EnqueuedItem) -> Result<()> {
        self.store.append_item(item).await
    }

    /// Lazily page through one partition in key order.
    ///
    /// Nothing is fetched until the stream is polled, and at most one page is
    /// held at a time.
    pub fn scan(&self, partition: Partition, page_size: usize) -> ResultStream<EnqueuedItem> {
        self.scan_from(partition, None, page_size)
    }

    /// Resume a partition scan after a previously returned token.
    pub fn scan_from(
        &self,
        partition: Partition,
        from: Option<ContinuationToken>,
        page_size: usize,
    ) -> ResultStream<EnqueuedItem> {
        let store = Arc::clone(&self.store);
        paged(from, move |from| {
            let store = Arc::clone(&store);
            let partition = partition.clone();
            async move { store.scan_items(&partition, from.as_ref(), page_size).await }
        })
    }

    /// Fetch a single page. Used to prefetch partitions concurrently.
    pub async fn fetch_page(
        &self,
        partition: &Partition,
        from: Option<&ContinuationToken>,
        page_size: usize,
    ) -> Result<Page<EnqueuedItem>> {
        self.store.scan_items(partition, from, page_size).await
    }

    /// Emptiness check that does not materialize records.
    pub async fn has_items(&self, partition: &Partition) -> Result<bool> {
        self.store.has_items(partition).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketId, ContentRef, ItemKey, QueueName, Slice};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use futures_util::TryStreamExt;
    use std::collections::HashSet;

    fn item(partition: &Partition, n: usize) -> EnqueuedItem {
        EnqueuedItem {
            queue: partition.queue.clone(),
            slice: partition.slice,
            bucket: partition.bucket,
            key: ItemKey::new(),
            enqueued_at: Utc::now(),
            name: format!("mail-{n}"),
            sender: None,
            recipients: Vec::new(),
            header_ref: ContentRef::from("h"),
            body_ref: ContentRef::from("b"),
            attributes: Default::default(),
        }
    }

    async fn filled(n: usize) -> (EnqueuedItemIndex, Partition) {
        let index = EnqueuedItemIndex::new(Arc::new(MemoryStore::new()));
        let partition = Partition::new(QueueName::from("spool"), Slice(3), BucketId(0));
        for i in 0..n {
            index.append(&item(&partition, i)).await.unwrap();
        }
        (index, partition)
    }

    #[tokio::test]
    async fn page_size_does_not_change_the_result() {
        let (index, partition) = filled(450).await;

        let by_200: Vec<EnqueuedItem> = index
            .scan(partition.clone(), 200)
            .try_collect()
            .await
            .unwrap();
        let by_450: Vec<EnqueuedItem> = index.scan(partition, 450).try_collect().await.unwrap();

        let keys_200: HashSet<ItemKey> = by_200.iter().map(|i| i.key).collect();
        let keys_450: HashSet<ItemKey> = by_450.iter().map(|i| i.key).collect();
        assert_eq!(by_200.len(), 450);
        assert_eq!(by_450.len(), 450);
        assert_eq!(keys_200.len(), 450);
        assert_eq!(keys_200, keys_450);
    }

    #[tokio::test]
    async fn scan_yields_key_order() {
        let (index, partition) = filled(25).await;
        let items: Vec<EnqueuedItem> = index.scan(partition, 4).try_collect().await.unwrap();
        assert!(items.windows(2).all(|w| w[0].key < w[1].key));
    }

    #[tokio::test]
    async fn scan_resumes_from_token() {
        let (index, partition) = filled(10).await;
        let first = index.fetch_page(&partition, None, 4).await.unwrap();
        let rest: Vec<EnqueuedItem> = index
            .scan_from(partition, first.next, 4)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first.items.len() + rest.len(), 10);
        assert!(first.items.last().unwrap().key < rest[0].key);
    }

    #[tokio::test]
    async fn empty_partition_reports_no_items() {
        let (index, partition) = filled(0).await;
        assert!(!index.has_items(&partition).await.unwrap());
        let items: Vec<EnqueuedItem> = index.scan(partition, 10).try_collect().await.unwrap();
        assert!(items.is_empty());
    }
}
