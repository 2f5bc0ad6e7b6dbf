//! Span helpers for view operations.
//!
//! Every public operation runs inside one of these spans so browse,
//! delete and maintenance activity of a queue can be followed end to end.

use tracing::Span;

use crate::model::{ItemKey, QueueName, Slice};

/// Span for recording one item. `view.slice` is filled once allocated.
pub fn start_record_span(queue: &QueueName, key: &ItemKey) -> Span {
    tracing::info_span!(
        "view.record",
        "view.queue" = %queue,
        "view.key" = %key,
        "view.slice" = tracing::field::Empty,
    )
}

/// Span for one browse. `view.start` is filled once the browse start is read.
pub fn start_browse_span(queue: &QueueName) -> Span {
    tracing::info_span!(
        "view.browse",
        "view.queue" = %queue,
        "view.start" = tracing::field::Empty,
    )
}

pub fn start_delete_span(queue: &QueueName, key: &ItemKey, slice: Slice) -> Span {
    tracing::info_span!(
        "view.delete",
        "view.queue" = %queue,
        "view.key" = %key,
        "view.slice" = %slice,
    )
}

pub fn start_maintenance_span(queue: &QueueName) -> Span {
    tracing::info_span!(
        "view.maintenance",
        "view.queue" = %queue,
        "view.from" = tracing::field::Empty,
        "view.to" = tracing::field::Empty,
    )
}

/// Record a browse-start move on the maintenance span.
pub fn record_advance(span: &Span, from: Slice, to: Slice) {
    span.record("view.from", tracing::field::display(from));
    span.record("view.to", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "browse_start_advanced");
    });
}
