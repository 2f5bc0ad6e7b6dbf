//! Storage engine interface consumed by the view components.
//!
//! A partitioned key/range store: ordered, pageable scans within a partition,
//! point reads and writes, and one conditional write for the browse start.
//! Every write here is idempotent, so callers may retry freely.

pub mod memory;
pub mod retry;

pub use memory::MemoryStore;
pub use retry::RetryingStore;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{EnqueuedItem, ItemKey, Partition, QueueName, Slice};

/// Resume point of a paged scan. Opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Token resuming strictly after `key`.
    pub fn after(key: ItemKey) -> Self {
        Self(key.to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last key already returned to the caller.
    pub fn last_key(&self) -> Result<ItemKey> {
        self.0
            .parse()
            .map_err(|_| Error::InvalidToken(self.0.clone()))
    }
}

/// One page of a scan. `next` is `None` once the range is exhausted.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<ContinuationToken>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next: None,
        }
    }

    /// Build a page from at most `limit` keyed rows. A full page carries a
    /// token for the following one.
    pub(crate) fn from_rows(items: Vec<T>, limit: usize, key_of: impl Fn(&T) -> ItemKey) -> Self {
        let next = if items.len() >= limit {
            items.last().map(|last| ContinuationToken::after(key_of(last)))
        } else {
            None
        };
        Self { items, next }
    }
}

/// Precondition of a conditional browse-start write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceCondition {
    /// No browse start is stored for the queue yet.
    Absent,
    /// The stored browse start is strictly below the proposed value.
    Below,
}

#[async_trait]
pub trait ViewStore: Send + Sync {
    // --- enqueued items ---

    /// Write-once insert. Re-appending an existing key leaves the stored
    /// record untouched.
    async fn append_item(&self, item: &EnqueuedItem) -> Result<()>;

    /// Up to `limit` items of one partition in key order, after `from`.
    async fn scan_items(
        &self,
        partition: &Partition,
        from: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page<EnqueuedItem>>;

    async fn has_items(&self, partition: &Partition) -> Result<bool>;

    // --- tombstones ---

    async fn put_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<()>;

    async fn has_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<bool>;

    async fn scan_tombstones(
        &self,
        queue: &QueueName,
        from: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page<ItemKey>>;

    // --- browse start ---

    async fn read_browse_start(&self, queue: &QueueName) -> Result<Option<Slice>>;

    /// Store `new` only if `condition` holds. Returns whether it was applied.
    async fn compare_and_swap_browse_start(
        &self,
        queue: &QueueName,
        condition: SliceCondition,
        new: Slice,
    ) -> Result<bool>;
}
