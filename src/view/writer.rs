//! Records items into the index once the transport has accepted them.
//!
//! Indexing happens after transport hand-off and is never rolled back
//! against it. When indexing fails the item is still delivered, it just does
//! not show up when browsing; callers get [`Error::Indexing`] so they can
//! report or re-record it.

use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, warn};

use crate::error::{Error, Result};
use crate::model::{EnqueuedItem, ItemKey, NewItem, QueueName};
use crate::telemetry::{metrics, view::start_record_span};

use super::browse_start::BrowseStartTracker;
use super::index::EnqueuedItemIndex;
use super::slice::SliceAllocator;

#[derive(Clone)]
pub struct IndexWriter {
    allocator: SliceAllocator,
    index: EnqueuedItemIndex,
    tracker: BrowseStartTracker,
    settle_slices: u32,
}

impl IndexWriter {
    pub fn new(
        allocator: SliceAllocator,
        index: EnqueuedItemIndex,
        tracker: BrowseStartTracker,
        settle_slices: u32,
    ) -> Self {
        Self {
            allocator,
            index,
            tracker,
            settle_slices,
        }
    }

    /// Record an item the transport has durably accepted.
    ///
    /// Recording the same key twice with the same content is a no-op.
    pub async fn record(
        &self,
        queue: &QueueName,
        new: NewItem,
        enqueued_at: DateTime<Utc>,
    ) -> Result<ItemKey> {
        let key = new.key.unwrap_or_else(|| ItemKey::at(enqueued_at));
        let span = start_record_span(queue, &key);
        let started = Instant::now();

        let (slice, bucket) = self.allocator.allocate(queue, &key, enqueued_at);
        span.record("view.slice", tracing::field::display(slice));

        let item = EnqueuedItem {
            queue: queue.clone(),
            slice,
            bucket,
            key,
            enqueued_at,
            name: new.name,
            sender: new.sender,
            recipients: new.recipients,
            header_ref: new.header_ref,
            body_ref: new.body_ref,
            attributes: new.attributes,
        };

        let result = self.write(&item).instrument(span.clone()).await;

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1_000.0,
            &[KeyValue::new("operation", "view.record")],
        );

        let outcome = match &result {
            Ok(()) => "ok",
            Err(Error::Indexing { reason, .. }) if reason == BEHIND_BROWSE_START => {
                "behind_browse_start"
            }
            Err(_) => "error",
        };
        metrics::items_recorded().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("result", outcome),
            ],
        );

        span.in_scope(|| match &result {
            Ok(()) => debug!(%slice, %bucket, "item recorded"),
            Err(e) => warn!("item accepted by transport but not browsable: {e}"),
        });
        result.map(|()| key)
    }

    async fn write(&self, item: &EnqueuedItem) -> Result<()> {
        let indexing = |e: Error| Error::Indexing {
            queue: item.queue.clone(),
            key: item.key,
            reason: e.to_string(),
        };

        // A new queue opens a few slices behind its first item so that
        // records racing in with slightly older timestamps stay reachable.
        self.tracker
            .open(&item.queue, item.slice.saturating_sub(self.settle_slices))
            .await
            .map_err(indexing)?;

        self.index.append(item).await.map_err(indexing)?;

        // Maintenance may have moved the start while the append was in
        // flight, so only the value read after the append counts.
        let start = self.tracker.current(&item.queue).await.map_err(indexing)?;
        if start.is_some_and(|start| item.slice < start) {
            return Err(Error::Indexing {
                queue: item.queue.clone(),
                key: item.key,
                reason: BEHIND_BROWSE_START.to_string(),
            });
        }
        Ok(())
    }
}

const BEHIND_BROWSE_START: &str = "slice is behind the queue's browse start";
