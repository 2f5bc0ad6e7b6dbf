//! Integration tests for telemetry initialization and span helpers.

use mailqueue_view::model::{ItemKey, QueueName, Slice};
use mailqueue_view::telemetry::view;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = mailqueue_view::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "mqview-test".to_string(),
        default_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = mailqueue_view::telemetry::init_telemetry(config);
}

#[test]
fn record_span_accepts_slice() {
    let span = view::start_record_span(&QueueName::from("spool"), &ItemKey::new());
    span.record("view.slice", tracing::field::display(Slice(42)));
}

#[test]
fn maintenance_span_records_advance() {
    let span = view::start_maintenance_span(&QueueName::from("spool"));
    view::record_advance(&span, Slice(10), Slice(12));
}

#[test]
fn browse_and_delete_spans_create() {
    let queue = QueueName::from("spool");
    let _browse = view::start_browse_span(&queue);
    let _delete = view::start_delete_span(&queue, &ItemKey::new(), Slice(3));
}
