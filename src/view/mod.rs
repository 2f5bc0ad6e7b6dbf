//! The browsable view over a mail queue.
//!
//! Components are built explicitly around one shared [`ViewStore`] and
//! composed by [`QueueView`]:
//!
//! - [`SliceAllocator`] places items into `(slice, bucket)` partitions.
//! - [`IndexWriter`] records items after the transport accepted them.
//! - [`BrowseReader`] streams live items from the browse start onwards.
//! - [`Eraser`] tombstones items and keeps the browse start moving.

pub mod browse_start;
pub mod eraser;
pub mod index;
pub mod reader;
pub mod slice;
pub mod tombstone;
pub mod writer;

pub use browse_start::{Advance, BrowseStartTracker};
pub use eraser::Eraser;
pub use index::EnqueuedItemIndex;
pub use reader::{Browse, BrowseReader, PartitionFailure};
pub use slice::SliceAllocator;
pub use tombstone::TombstoneStore;
pub use writer::IndexWriter;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt, future};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ViewConfig;
use crate::error::{Error, Result};
use crate::model::{DetailedItem, EnqueuedItem, ItemFilter, ItemKey, NewItem, QueueName, Slice};
use crate::store::{ContinuationToken, MemoryStore, Page, ViewStore};
use crate::transport::{BlobStore, Transport, TransportMessage, TransportReceipt};

pub type ResultStream<T> = BoxStream<'static, Result<T>>;

/// Turn a page fetcher into a lazy stream of items. The next page is only
/// requested once the previous one has been consumed.
pub(crate) fn paged<T, F, Fut>(from: Option<ContinuationToken>, fetch: F) -> ResultStream<T>
where
    T: Send + 'static,
    F: FnMut(Option<ContinuationToken>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Page<T>>> + Send + 'static,
{
    stream::try_unfold((Some(from), fetch), |(cursor, mut fetch)| async move {
        let Some(from) = cursor else {
            return Ok::<_, Error>(None);
        };
        let page = fetch(from).await?;
        Ok(Some((page.items, (page.next.map(Some), fetch))))
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

/// Outcome of [`QueueView::enqueue`]. Either way the transport owns the
/// message; `Unindexed` only means it will not show up when browsing.
#[derive(Debug)]
pub enum Enqueued {
    Indexed {
        key: ItemKey,
        receipt: TransportReceipt,
    },
    Unindexed {
        key: ItemKey,
        receipt: TransportReceipt,
        error: Error,
    },
}

impl Enqueued {
    pub fn key(&self) -> ItemKey {
        match self {
            Enqueued::Indexed { key, .. } | Enqueued::Unindexed { key, .. } => *key,
        }
    }

    pub fn receipt(&self) -> &TransportReceipt {
        match self {
            Enqueued::Indexed { receipt, .. } | Enqueued::Unindexed { receipt, .. } => receipt,
        }
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self, Enqueued::Indexed { .. })
    }
}

/// Browsable, manageable view of the queues held in one store.
pub struct QueueView {
    allocator: SliceAllocator,
    tombstones: TombstoneStore,
    tracker: BrowseStartTracker,
    writer: IndexWriter,
    reader: BrowseReader,
    eraser: Eraser,
    clock: Arc<dyn Clock>,
    settle_slices: u32,
}

impl QueueView {
    pub fn new(store: Arc<dyn ViewStore>, config: ViewConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ViewStore>,
        config: ViewConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let allocator = SliceAllocator::from_config(&config);
        let index = EnqueuedItemIndex::new(Arc::clone(&store));
        let tombstones = TombstoneStore::new(Arc::clone(&store));
        let tracker = BrowseStartTracker::new(store);

        let writer = IndexWriter::new(
            allocator.clone(),
            index.clone(),
            tracker.clone(),
            config.settle_slices,
        );
        let reader = BrowseReader::new(
            allocator.clone(),
            index.clone(),
            tombstones.clone(),
            tracker.clone(),
            Arc::clone(&clock),
            config.page_size,
            config.fan_out,
            config.failure_policy,
        );
        let eraser = Eraser::new(
            allocator.clone(),
            index,
            tombstones.clone(),
            tracker.clone(),
            Arc::clone(&clock),
            config.advance_policy,
            config.settle_slices,
            config.page_size,
        );

        Ok(Self {
            allocator,
            tombstones,
            tracker,
            writer,
            reader,
            eraser,
            clock,
            settle_slices: config.settle_slices,
        })
    }

    /// A throwaway view backed by [`MemoryStore`].
    pub fn in_memory(config: ViewConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn allocator(&self) -> &SliceAllocator {
        &self.allocator
    }

    /// Open `queue` for browsing as of now. Queues are also opened by their
    /// first record, so this only matters for browsing a queue before it
    /// receives anything.
    pub async fn init_queue(&self, queue: &QueueName) -> Result<Slice> {
        let slice = self
            .allocator
            .slice_of(self.clock.now())
            .saturating_sub(self.settle_slices);
        let start = self.tracker.open(queue, slice).await?;
        info!(queue = %queue, start = %start, "queue opened");
        Ok(start)
    }

    /// Record an item the transport accepted just now.
    pub async fn record(&self, queue: &QueueName, item: NewItem) -> Result<ItemKey> {
        self.writer.record(queue, item, self.clock.now()).await
    }

    /// Record an item accepted at `enqueued_at`, e.g. when replaying.
    pub async fn record_at(
        &self,
        queue: &QueueName,
        item: NewItem,
        enqueued_at: DateTime<Utc>,
    ) -> Result<ItemKey> {
        self.writer.record(queue, item, enqueued_at).await
    }

    /// Hand an item to the transport, then record it.
    ///
    /// Transport errors are returned as-is: nothing was enqueued. Indexing
    /// errors are not, because the message is already on its way.
    pub async fn enqueue<T: Transport + ?Sized>(
        &self,
        transport: &T,
        queue: &QueueName,
        item: NewItem,
    ) -> Result<Enqueued> {
        let enqueued_at = self.clock.now();
        let key = item.key.unwrap_or_else(|| ItemKey::at(enqueued_at));
        let item = item.key(key);

        let message = TransportMessage {
            queue: queue.clone(),
            key,
            name: item.name.clone(),
            enqueued_at,
            header_ref: item.header_ref.clone(),
            body_ref: item.body_ref.clone(),
        };
        let receipt = transport.enqueue(&message).await?;

        Ok(match self.writer.record(queue, item, enqueued_at).await {
            Ok(key) => Enqueued::Indexed { key, receipt },
            Err(error) => {
                warn!(queue = %queue, key = %key, receipt = %receipt, "enqueued without index: {error}");
                Enqueued::Unindexed {
                    key,
                    receipt,
                    error,
                }
            }
        })
    }

    /// Stream the live items of `queue` in `(slice, bucket, key)` order.
    pub async fn browse(&self, queue: &QueueName) -> Result<Browse> {
        self.reader.scan(queue).await
    }

    /// Like [`browse`](Self::browse), with header and body fetched from
    /// `blobs`. Items whose content is gone yield
    /// [`Error::ContentMissing`] without ending the stream.
    pub async fn browse_detailed(
        &self,
        queue: &QueueName,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Browse<DetailedItem>> {
        let browse = self.reader.scan(queue).await?;
        Ok(browse.map_items(move |items| {
            items
                .and_then(move |item| {
                    let blobs = Arc::clone(&blobs);
                    async move { detail(item, blobs.as_ref()).await }
                })
                .boxed()
        }))
    }

    /// Number of live items. Walks the whole browse range.
    pub async fn size(&self, queue: &QueueName) -> Result<usize> {
        self.browse(queue)
            .await?
            .try_fold(0usize, |n, _| future::ready(Ok(n + 1)))
            .await
    }

    pub async fn delete(&self, queue: &QueueName, key: ItemKey, slice: Slice) -> Result<()> {
        self.eraser.delete(queue, key, slice).await
    }

    pub async fn delete_item(&self, item: &EnqueuedItem) -> Result<()> {
        self.eraser.delete(&item.queue, item.key, item.slice).await
    }

    /// Delete every live item matching `filter`. Returns how many were
    /// deleted.
    pub async fn delete_matching(&self, queue: &QueueName, filter: &ItemFilter) -> Result<usize> {
        let mut browse = self.browse(queue).await?;
        let mut deleted = 0;
        while let Some(item) = browse.try_next().await? {
            if filter.matches(&item) {
                self.delete_item(&item).await?;
                deleted += 1;
            }
        }
        info!(queue = %queue, ?filter, deleted, "deleted matching items");
        Ok(deleted)
    }

    pub async fn is_deleted(&self, queue: &QueueName, key: ItemKey) -> Result<bool> {
        self.tombstones.is_deleted(queue, key).await
    }

    pub async fn advance_browse_start(&self, queue: &QueueName) -> Result<Advance> {
        self.eraser.advance_browse_start(queue).await
    }

    pub async fn browse_start(&self, queue: &QueueName) -> Result<Option<Slice>> {
        self.tracker.current(queue).await
    }
}

async fn detail(item: EnqueuedItem, blobs: &dyn BlobStore) -> Result<DetailedItem> {
    let (header, body) =
        futures_util::try_join!(blobs.get(&item.header_ref), blobs.get(&item.body_ref))?;
    Ok(DetailedItem { item, header, body })
}
