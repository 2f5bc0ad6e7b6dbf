//! Deletion and browse-start maintenance.
//!
//! Deleting only writes a tombstone; the index record stays. Maintenance
//! then moves the browse start past slices that no longer hold live items,
//! so browses stop paying for fully deleted history.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::TryStreamExt;
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, warn};

use crate::clock::Clock;
use crate::config::AdvancePolicy;
use crate::error::Result;
use crate::model::{ItemKey, Partition, QueueName, Slice};
use crate::telemetry::{
    metrics,
    view::{record_advance, start_delete_span, start_maintenance_span},
};

use super::browse_start::{Advance, BrowseStartTracker};
use super::index::EnqueuedItemIndex;
use super::slice::SliceAllocator;
use super::tombstone::TombstoneStore;

pub struct Eraser {
    allocator: SliceAllocator,
    index: EnqueuedItemIndex,
    tombstones: TombstoneStore,
    tracker: BrowseStartTracker,
    clock: Arc<dyn Clock>,
    policy: AdvancePolicy,
    settle_slices: u32,
    page_size: usize,
    deletes: AtomicU64,
}

impl Eraser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        allocator: SliceAllocator,
        index: EnqueuedItemIndex,
        tombstones: TombstoneStore,
        tracker: BrowseStartTracker,
        clock: Arc<dyn Clock>,
        policy: AdvancePolicy,
        settle_slices: u32,
        page_size: usize,
    ) -> Self {
        Self {
            allocator,
            index,
            tombstones,
            tracker,
            clock,
            policy,
            settle_slices,
            page_size: page_size.max(1),
            deletes: AtomicU64::new(0),
        }
    }

    /// Hide an item from all future browses. Deleting twice is a no-op.
    ///
    /// `slice` is the item's slice as returned by a browse. It is recorded
    /// on the span and not checked against the index.
    pub async fn delete(&self, queue: &QueueName, key: ItemKey, slice: Slice) -> Result<()> {
        let span = start_delete_span(queue, &key, slice);

        self.tombstones
            .mark_deleted(queue, key)
            .instrument(span.clone())
            .await?;
        metrics::items_deleted().add(1, &[KeyValue::new("queue", queue.to_string())]);

        if self.should_maintain() {
            if let Err(e) = self
                .advance_browse_start(queue)
                .instrument(span.clone())
                .await
            {
                span.in_scope(|| warn!("browse start maintenance failed: {e}"));
            }
        }
        Ok(())
    }

    fn should_maintain(&self) -> bool {
        match self.policy {
            AdvancePolicy::Manual => false,
            AdvancePolicy::Eager => true,
            AdvancePolicy::EveryNth(n) => {
                let count = self.deletes.fetch_add(1, Ordering::Relaxed) + 1;
                count % u64::from(n.max(1)) == 0
            }
        }
    }

    /// Move the browse start of `queue` up to the first slice that still
    /// holds a live item, never past `slice(now) - settle_slices`.
    pub async fn advance_browse_start(&self, queue: &QueueName) -> Result<Advance> {
        let span = start_maintenance_span(queue);
        let result = self.advance(queue).instrument(span.clone()).await;

        let outcome = match &result {
            Ok((Advance::Advanced, from, to)) => {
                record_advance(&span, *from, *to);
                "advanced"
            }
            Ok((Advance::Unchanged, ..)) => "unchanged",
            Err(_) => "error",
        };
        metrics::browse_start_updates().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("result", outcome),
            ],
        );
        result.map(|(advance, ..)| advance)
    }

    async fn advance(&self, queue: &QueueName) -> Result<(Advance, Slice, Slice)> {
        let Some(start) = self.tracker.current(queue).await? else {
            return Ok((Advance::Unchanged, Slice::MIN, Slice::MIN));
        };
        let limit = self
            .allocator
            .slice_of(self.clock.now())
            .saturating_sub(self.settle_slices);
        if start >= limit {
            debug!(%start, %limit, "browse start already at the settle limit");
            return Ok((Advance::Unchanged, start, start));
        }

        let mut target = limit;
        'slices: for slice in (start.0..limit.0).map(Slice) {
            for partition in self.allocator.partitions(queue, slice) {
                if !self.index.has_items(&partition).await? {
                    continue;
                }
                if self.has_live_item(partition).await? {
                    target = slice;
                    break 'slices;
                }
            }
        }

        if target <= start {
            return Ok((Advance::Unchanged, start, start));
        }
        let advance = self.tracker.advance_to(queue, target).await?;
        Ok((advance, start, target))
    }

    /// Tombstones are looked up per scanned record, so a run holds at most
    /// one page of the partition no matter how many deletions the queue has
    /// seen.
    async fn has_live_item(&self, partition: Partition) -> Result<bool> {
        let mut items = self.index.scan(partition, self.page_size);
        while let Some(item) = items.try_next().await? {
            if !self.tombstones.is_deleted(&item.queue, item.key).await? {
                debug!(key = %item.key, slice = %item.slice, "live item found");
                return Ok(true);
            }
        }
        Ok(false)
    }
}
