//! Placement of items into time slices and hash buckets.
//!
//! Pure and stateless. The bucket hash is CRC-32 over the queue name and the
//! key bytes, which is stable across processes and releases; bucket placement
//! is part of the on-disk layout.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::ViewConfig;
use crate::model::{BucketId, ItemKey, Partition, QueueName, Slice};

#[derive(Debug, Clone)]
pub struct SliceAllocator {
    bucket_count: u32,
    window_ms: i64,
}

impl SliceAllocator {
    pub fn new(bucket_count: u32, slice_window: Duration) -> Self {
        let window_ms = i64::try_from(slice_window.as_millis()).unwrap_or(i64::MAX);
        Self {
            bucket_count: bucket_count.max(1),
            window_ms: window_ms.max(1),
        }
    }

    pub fn from_config(config: &ViewConfig) -> Self {
        Self::new(config.bucket_count, config.slice_window())
    }

    /// Slice and bucket an item is stored under.
    pub fn allocate(
        &self,
        queue: &QueueName,
        key: &ItemKey,
        enqueued_at: DateTime<Utc>,
    ) -> (Slice, BucketId) {
        (self.slice_of(enqueued_at), self.bucket_of(queue, key))
    }

    pub fn slice_of(&self, at: DateTime<Utc>) -> Slice {
        Slice(at.timestamp_millis().div_euclid(self.window_ms))
    }

    pub fn bucket_of(&self, queue: &QueueName, key: &ItemKey) -> BucketId {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(queue.as_str().as_bytes());
        hasher.update(key.as_bytes());
        BucketId(hasher.finalize() % self.bucket_count)
    }

    /// First instant covered by `slice`.
    pub fn slice_start(&self, slice: Slice) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(slice.0.saturating_mul(self.window_ms))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Partitions of one slice in ascending bucket order.
    pub fn partitions<'a>(
        &self,
        queue: &'a QueueName,
        slice: Slice,
    ) -> impl Iterator<Item = Partition> + 'a {
        (0..self.bucket_count).map(move |b| Partition::new(queue.clone(), slice, BucketId(b)))
    }
}
