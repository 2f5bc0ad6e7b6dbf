//! Per-queue low-water mark of the browse range.
//!
//! The browse start must never pass the slice of a live item. It is only
//! ever written through the store's conditional write, so concurrent
//! advancers can race freely: the largest proposal wins and smaller ones
//! fail their condition.

use std::sync::Arc;

use crate::error::Result;
use crate::model::{QueueName, Slice};
use crate::store::{SliceCondition, ViewStore};

/// Outcome of [`BrowseStartTracker::advance_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Advanced,
    Unchanged,
}

#[derive(Clone)]
pub struct BrowseStartTracker {
    store: Arc<dyn ViewStore>,
}

impl BrowseStartTracker {
    pub fn new(store: Arc<dyn ViewStore>) -> Self {
        Self { store }
    }

    /// Current browse start, or [`Slice::MIN`] for a queue never written to.
    pub async fn get(&self, queue: &QueueName) -> Result<Slice> {
        Ok(self.current(queue).await?.unwrap_or(Slice::MIN))
    }

    pub async fn current(&self, queue: &QueueName) -> Result<Option<Slice>> {
        self.store.read_browse_start(queue).await
    }

    /// Set the browse start of a new queue. Returns the effective value,
    /// which is the existing one if the queue was already opened.
    pub async fn open(&self, queue: &QueueName, slice: Slice) -> Result<Slice> {
        if self
            .store
            .compare_and_swap_browse_start(queue, SliceCondition::Absent, slice)
            .await?
        {
            return Ok(slice);
        }
        self.get(queue).await
    }

    /// Move forward to `slice`. Proposals at or behind the stored value are
    /// ignored.
    pub async fn advance_to(&self, queue: &QueueName, slice: Slice) -> Result<Advance> {
        let applied = self
            .store
            .compare_and_swap_browse_start(queue, SliceCondition::Below, slice)
            .await?;
        Ok(if applied {
            Advance::Advanced
        } else {
            Advance::Unchanged
        })
    }
}
