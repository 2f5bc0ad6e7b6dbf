//! Smoke tests for the full observability stack.
//!
//! These tests require an OTLP collector with Tempo, Prometheus and Loki
//! behind it, listening on localhost.
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use futures_util::TryStreamExt;
use mailqueue_view::config::ViewConfig;
use mailqueue_view::model::{ContentRef, EnqueuedItem, NewItem, QueueName};
use mailqueue_view::view::QueueView;

static TELEMETRY: OnceLock<mailqueue_view::telemetry::TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static mailqueue_view::telemetry::TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        mailqueue_view::telemetry::init_telemetry(mailqueue_view::telemetry::TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: "mqview-smoke-test".to_string(),
            default_level: "info".to_string(),
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give backends time to ingest.
async fn flush_and_wait(guard: &mailqueue_view::telemetry::TelemetryGuard) {
    guard.force_flush();
    // Give batch exporters and backends time to process.
    tokio::time::sleep(Duration::from_secs(8)).await;
}

/// Record, browse and delete through a view so every signal type fires.
async fn exercise_view() {
    let view = QueueView::in_memory(ViewConfig::default()).unwrap();
    let queue = QueueName::from(format!("smoke-{}", Utc::now().timestamp()));

    for i in 0..3 {
        view.record(
            &queue,
            NewItem::new(format!("m{i}"), ContentRef::from("h"), ContentRef::from("b")),
        )
        .await
        .unwrap();
    }
    let items: Vec<EnqueuedItem> = view.browse(&queue).await.unwrap().try_collect().await.unwrap();
    view.delete_item(&items[0]).await.unwrap();
    view.advance_browse_start(&queue).await.unwrap();
    tracing::warn!(queue = %queue, "smoke test warning log");
}

#[test]
#[ignore]
fn smoke_full_lifecycle() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        exercise_view().await;
        flush_and_wait(guard).await;

        let client = reqwest::Client::new();

        // Tempo
        let resp = client
            .get("http://localhost:3200/api/search")
            .query(&[("tags", "service.name=mqview-smoke-test"), ("limit", "5")])
            .send()
            .await
            .expect("failed to query Tempo");
        let body: serde_json::Value = resp.json().await.unwrap();
        let trace_count = body["traces"].as_array().map_or(0, |t| t.len());
        println!("Tempo: {trace_count} trace(s)");
        assert!(trace_count > 0, "expected traces in Tempo");

        // Prometheus
        let resp = client
            .get("http://localhost:9090/api/v1/query")
            .query(&[("query", "mqview_items_recorded_total")])
            .send()
            .await
            .expect("failed to query Prometheus");
        let body: serde_json::Value = resp.json().await.unwrap();
        let metric_count = body["data"]["result"].as_array().map_or(0, |r| r.len());
        println!("Prometheus: {metric_count} series");
        assert!(metric_count > 0, "expected metrics in Prometheus");

        // Loki
        let resp = client
            .get("http://localhost:3100/loki/api/v1/query_range")
            .query(&[
                ("query", r#"{service_name="mqview-smoke-test"}"#),
                ("limit", "10"),
            ])
            .send()
            .await
            .expect("failed to query Loki");
        let body: serde_json::Value = resp.json().await.unwrap();
        let log_count = body["data"]["result"].as_array().map_or(0, |s| s.len());
        println!("Loki: {log_count} stream(s)");
        assert!(log_count > 0, "expected logs in Loki");
    });
}
