//! Lazy browse over the live items of a queue.
//!
//! Partitions are visited in ascending `(slice, bucket)` order from the
//! browse start up to the slice containing "now". "Now" is re-read as the
//! scan progresses, so a long browse of an active queue keeps picking up new
//! slices until it catches up with the clock.
//!
//! The first page of up to `fan_out` upcoming partitions is fetched
//! concurrently, so latency follows the slowest partition instead of the sum
//! of all of them. Everything else is pulled on demand: a slow consumer
//! holds at most `fan_out` pages in memory.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::{self, BoxStream, Stream};
use futures_util::{StreamExt, TryStreamExt, future};
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tracing::{Span, debug, warn};

use crate::clock::Clock;
use crate::config::FailurePolicy;
use crate::error::{Error, Result};
use crate::model::{BucketId, EnqueuedItem, Partition, QueueName, Slice};
use crate::telemetry::{metrics, view::start_browse_span};

use super::ResultStream;
use super::browse_start::BrowseStartTracker;
use super::index::EnqueuedItemIndex;
use super::slice::SliceAllocator;
use super::tombstone::TombstoneStore;

/// Tombstone lookups kept in flight per partition.
const TOMBSTONE_CHECKS_IN_FLIGHT: usize = 8;

/// A partition skipped under [`FailurePolicy::SkipAndContinue`].
#[derive(Debug)]
pub struct PartitionFailure {
    pub partition: Partition,
    pub error: Error,
}

/// Stream of live items plus the side channel of skipped partitions.
///
/// Dropping it cancels the browse; nothing needs cleaning up.
pub struct Browse<T = EnqueuedItem> {
    items: BoxStream<'static, Result<T>>,
    failures: mpsc::UnboundedReceiver<PartitionFailure>,
}

impl<T> Browse<T> {
    /// Partitions skipped so far. Complete once the stream has ended.
    pub fn failures(&mut self) -> Vec<PartitionFailure> {
        let mut failures = Vec::new();
        while let Ok(failure) = self.failures.try_recv() {
            failures.push(failure);
        }
        failures
    }

    pub fn into_parts(
        self,
    ) -> (
        BoxStream<'static, Result<T>>,
        mpsc::UnboundedReceiver<PartitionFailure>,
    ) {
        (self.items, self.failures)
    }

    /// Transform the item stream, keeping the failure channel.
    pub fn map_items<U>(
        self,
        f: impl FnOnce(BoxStream<'static, Result<T>>) -> BoxStream<'static, Result<U>>,
    ) -> Browse<U> {
        Browse {
            items: f(self.items),
            failures: self.failures,
        }
    }

    fn empty() -> Self
    where
        T: Send + 'static,
    {
        let (_, failures) = mpsc::unbounded_channel();
        Self {
            items: stream::empty().boxed(),
            failures,
        }
    }
}

impl<T> Stream for Browse<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_next_unpin(cx)
    }
}

#[derive(Clone)]
pub struct BrowseReader {
    allocator: SliceAllocator,
    index: EnqueuedItemIndex,
    tombstones: TombstoneStore,
    tracker: BrowseStartTracker,
    clock: Arc<dyn Clock>,
    page_size: usize,
    fan_out: usize,
    policy: FailurePolicy,
}

impl BrowseReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        allocator: SliceAllocator,
        index: EnqueuedItemIndex,
        tombstones: TombstoneStore,
        tracker: BrowseStartTracker,
        clock: Arc<dyn Clock>,
        page_size: usize,
        fan_out: usize,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            allocator,
            index,
            tombstones,
            tracker,
            clock,
            page_size: page_size.max(1),
            fan_out: fan_out.max(1),
            policy,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Start browsing `queue`. Only the browse start is read up front.
    pub async fn scan(&self, queue: &QueueName) -> Result<Browse> {
        let span = start_browse_span(queue);
        let Some(start) = self.tracker.current(queue).await? else {
            span.in_scope(|| debug!("queue never written to, nothing to browse"));
            return Ok(Browse::empty());
        };
        span.record("view.start", tracing::field::display(start));

        let (failures_tx, failures) = mpsc::unbounded_channel();
        let items = self
            .partitions(queue.clone(), start)
            .map({
                let reader = self.clone();
                move |partition| {
                    let reader = reader.clone();
                    async move { reader.first_page(partition).await }
                }
            })
            .buffered(self.fan_out)
            .flatten();
        let items = apply_policy(items, self.policy, failures_tx, span);

        let counter = metrics::items_browsed();
        let labels = [KeyValue::new("queue", queue.to_string())];
        let items = items
            .inspect(move |item| {
                if item.is_ok() {
                    counter.add(1, &labels);
                }
            })
            .boxed();

        Ok(Browse { items, failures })
    }

    /// `(slice, bucket)` pairs from `start` up to the slice containing "now".
    fn partitions(&self, queue: QueueName, start: Slice) -> BoxStream<'static, Partition> {
        let allocator = self.allocator.clone();
        let clock = Arc::clone(&self.clock);
        stream::unfold(Some((start, 0u32)), move |cursor| {
            let (slice, bucket) = match cursor {
                Some(cursor) => cursor,
                None => return future::ready(None),
            };
            if slice > allocator.slice_of(clock.now()) {
                return future::ready(None);
            }
            let next = if bucket + 1 < allocator.bucket_count() {
                Some((slice, bucket + 1))
            } else if slice < Slice(i64::MAX) {
                Some((slice.next(), 0))
            } else {
                None
            };
            let partition = Partition::new(queue.clone(), slice, BucketId(bucket));
            future::ready(Some((partition, next)))
        })
        .boxed()
    }

    /// Fetch the first page of a partition, then continue lazily. Yields the
    /// partition's live items with errors tagged by partition.
    async fn first_page(&self, partition: Partition) -> ResultStream<EnqueuedItem> {
        let raw: ResultStream<EnqueuedItem> =
            match self.index.fetch_page(&partition, None, self.page_size).await {
                Ok(page) => {
                    let head = stream::iter(page.items.into_iter().map(Ok));
                    match page.next {
                        Some(token) => head
                            .chain(self.index.scan_from(
                                partition.clone(),
                                Some(token),
                                self.page_size,
                            ))
                            .boxed(),
                        None => head.boxed(),
                    }
                }
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            };

        let tombstones = self.tombstones.clone();
        raw.map(move |result| {
            let tombstones = tombstones.clone();
            async move {
                let item = result?;
                let deleted = tombstones.is_deleted(&item.queue, item.key).await?;
                Ok::<_, Error>((!deleted).then_some(item))
            }
        })
        .buffered(TOMBSTONE_CHECKS_IN_FLIGHT)
        .try_filter_map(|item| future::ready(Ok(item)))
        .map_err(move |e| Error::Partition {
            partition: partition.clone(),
            source: Box::new(e),
        })
        .scan(false, |failed, result| {
            if *failed {
                return future::ready(None);
            }
            *failed = result.is_err();
            future::ready(Some(result))
        })
        .boxed()
    }
}

/// Enforce the partial failure policy on the flattened partition streams.
///
/// A failing partition ends after its first error, so skipping it only means
/// diverting that one error to the side channel.
fn apply_policy(
    items: impl Stream<Item = Result<EnqueuedItem>> + Send + 'static,
    policy: FailurePolicy,
    failures: mpsc::UnboundedSender<PartitionFailure>,
    span: Span,
) -> impl Stream<Item = Result<EnqueuedItem>> + Send + 'static {
    items
        .scan(false, move |stopped, result| {
            if *stopped {
                return future::ready(None);
            }
            let next = match (result, policy) {
                (Ok(item), _) => Some(Ok(item)),
                (Err(e), FailurePolicy::FailFast) => {
                    span.in_scope(|| warn!("aborting browse: {e}"));
                    record_failure(policy);
                    *stopped = true;
                    Some(Err(e))
                }
                (Err(Error::Partition { partition, source }), FailurePolicy::SkipAndContinue) => {
                    span.in_scope(|| warn!(%partition, "skipping partition: {source}"));
                    let failure = PartitionFailure {
                        partition,
                        error: *source,
                    };
                    record_failure(policy);
                    // The receiver may already be gone; the metric still counts it.
                    let _ = failures.send(failure);
                    None
                }
                (Err(e), FailurePolicy::SkipAndContinue) => Some(Err(e)),
            };
            future::ready(Some(next))
        })
        .filter_map(future::ready)
}

fn record_failure(policy: FailurePolicy) {
    let policy = match policy {
        FailurePolicy::FailFast => "fail_fast",
        FailurePolicy::SkipAndContinue => "skip_and_continue",
    };
    metrics::partition_failures().add(1, &[KeyValue::new("policy", policy)]);
}
