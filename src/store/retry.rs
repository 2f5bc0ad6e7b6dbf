//! Transient-error retry at the storage client boundary.
//!
//! Wraps any [`ViewStore`] and retries calls failing with a transient error,
//! doubling the backoff between attempts up to a ceiling. Non-transient
//! errors and exhausted retries are returned to the caller unchanged.

use std::future::Future;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::warn;

use super::{ContinuationToken, Page, SliceCondition, ViewStore};
use crate::config::RetryConfig;
use crate::error::Result;
use crate::model::{EnqueuedItem, ItemKey, Partition, QueueName, Slice};
use crate::telemetry::metrics;

pub struct RetryingStore<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: ViewStore> RetryingStore<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut backoff = self.config.initial_backoff();
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient storage error, retrying: {e}"
                    );
                    metrics::storage_retries().add(1, &[KeyValue::new("operation", operation)]);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff());
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl<S: ViewStore> ViewStore for RetryingStore<S> {
    async fn append_item(&self, item: &EnqueuedItem) -> Result<()> {
        self.retry("append_item", || self.inner.append_item(item))
            .await
    }

    async fn scan_items(
        &self,
        partition: &Partition,
        from: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page<EnqueuedItem>> {
        self.retry("scan_items", || self.inner.scan_items(partition, from, limit))
            .await
    }

    async fn has_items(&self, partition: &Partition) -> Result<bool> {
        self.retry("has_items", || self.inner.has_items(partition))
            .await
    }

    async fn put_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<()> {
        self.retry("put_tombstone", || self.inner.put_tombstone(queue, key))
            .await
    }

    async fn has_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<bool> {
        self.retry("has_tombstone", || self.inner.has_tombstone(queue, key))
            .await
    }

    async fn scan_tombstones(
        &self,
        queue: &QueueName,
        from: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page<ItemKey>> {
        self.retry("scan_tombstones", || {
            self.inner.scan_tombstones(queue, from, limit)
        })
        .await
    }

    async fn read_browse_start(&self, queue: &QueueName) -> Result<Option<Slice>> {
        self.retry("read_browse_start", || self.inner.read_browse_start(queue))
            .await
    }

    // A retried write that had already landed fails its condition on the
    // next attempt, which reports "not applied" rather than an error.
    async fn compare_and_swap_browse_start(
        &self,
        queue: &QueueName,
        condition: SliceCondition,
        new: Slice,
    ) -> Result<bool> {
        self.retry("compare_and_swap_browse_start", || {
            self.inner.compare_and_swap_browse_start(queue, condition, new)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `has_tombstone` with a transient error a fixed number of times.
    struct Flaky {
        inner: MemoryStore,
        failures_left: AtomicU32,
        calls: AtomicU32,
        transient: bool,
    }

    impl Flaky {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                transient,
            }
        }
    }

    #[async_trait]
    impl ViewStore for Flaky {
        async fn append_item(&self, item: &EnqueuedItem) -> Result<()> {
            self.inner.append_item(item).await
        }

        async fn scan_items(
            &self,
            partition: &Partition,
            from: Option<&ContinuationToken>,
            limit: usize,
        ) -> Result<Page<EnqueuedItem>> {
            self.inner.scan_items(partition, from, limit).await
        }

        async fn has_items(&self, partition: &Partition) -> Result<bool> {
            self.inner.has_items(partition).await
        }

        async fn put_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<()> {
            self.inner.put_tombstone(queue, key).await
        }

        async fn has_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(if self.transient {
                    Error::Unavailable("partition offline".into())
                } else {
                    Error::Other("corrupt row".into())
                });
            }
            self.inner.has_tombstone(queue, key).await
        }

        async fn scan_tombstones(
            &self,
            queue: &QueueName,
            from: Option<&ContinuationToken>,
            limit: usize,
        ) -> Result<Page<ItemKey>> {
            self.inner.scan_tombstones(queue, from, limit).await
        }

        async fn read_browse_start(&self, queue: &QueueName) -> Result<Option<Slice>> {
            self.inner.read_browse_start(queue).await
        }

        async fn compare_and_swap_browse_start(
            &self,
            queue: &QueueName,
            condition: SliceCondition,
            new: Slice,
        ) -> Result<bool> {
            self.inner
                .compare_and_swap_browse_start(queue, condition, new)
                .await
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let store = RetryingStore::new(Flaky::new(2, true), fast_retry(3));
        let deleted = store
            .has_tombstone(&QueueName::from("spool"), ItemKey::new())
            .await
            .unwrap();
        assert!(!deleted);
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let store = RetryingStore::new(Flaky::new(5, true), fast_retry(3));
        let result = store
            .has_tombstone(&QueueName::from("spool"), ItemKey::new())
            .await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let store = RetryingStore::new(Flaky::new(1, false), fast_retry(3));
        let result = store
            .has_tombstone(&QueueName::from("spool"), ItemKey::new())
            .await;
        assert!(matches!(result, Err(Error::Other(_))));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
    }
}
