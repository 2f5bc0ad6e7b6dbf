//! Metric instrument factories for mailqueue-view.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"mailqueue-view"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for mailqueue-view instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("mailqueue-view")
}

/// Counter: items recorded into the index.
/// Labels: `queue`, `result` ("ok" | "behind_browse_start" | "error").
pub fn items_recorded() -> Counter<u64> {
    meter()
        .u64_counter("mqview.items.recorded")
        .with_description("Number of enqueued items recorded into the view")
        .build()
}

/// Counter: items tombstoned.
/// Labels: `queue`.
pub fn items_deleted() -> Counter<u64> {
    meter()
        .u64_counter("mqview.items.deleted")
        .with_description("Number of items marked deleted")
        .build()
}

/// Counter: live items yielded by browses.
/// Labels: `queue`.
pub fn items_browsed() -> Counter<u64> {
    meter()
        .u64_counter("mqview.items.browsed")
        .with_description("Number of live items yielded by browse scans")
        .build()
}

/// Counter: browse-start maintenance runs.
/// Labels: `queue`, `result` ("advanced" | "unchanged" | "error").
pub fn browse_start_updates() -> Counter<u64> {
    meter()
        .u64_counter("mqview.browse_start.updates")
        .with_description("Number of browse start maintenance runs")
        .build()
}

/// Counter: partitions that failed during a browse.
/// Labels: `policy`.
pub fn partition_failures() -> Counter<u64> {
    meter()
        .u64_counter("mqview.browse.partition_failures")
        .with_description("Number of partitions that failed to scan")
        .build()
}

/// Counter: storage calls retried after a transient error.
/// Labels: `operation`.
pub fn storage_retries() -> Counter<u64> {
    meter()
        .u64_counter("mqview.storage.retries")
        .with_description("Number of storage calls retried")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("mqview.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: pgmq transport calls.
/// Labels: `queue`, `operation` ("create" | "send").
pub fn transport_operations() -> Counter<u64> {
    meter()
        .u64_counter("mqview.transport.operations")
        .with_description("Number of pgmq transport operations")
        .build()
}
