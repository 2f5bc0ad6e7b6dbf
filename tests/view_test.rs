//! End-to-end behavior of the queue view against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures_util::{StreamExt, TryStreamExt};
use mailqueue_view::clock::ManualClock;
use mailqueue_view::config::{AdvancePolicy, ViewConfig};
use mailqueue_view::error::Error;
use mailqueue_view::model::{ContentRef, EnqueuedItem, ItemFilter, ItemKey, NewItem, QueueName, Slice};
use mailqueue_view::store::MemoryStore;
use mailqueue_view::transport::{BlobStore, MemoryBlobStore, MemoryTransport};
use mailqueue_view::view::{Advance, QueueView};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

fn hour_slice(at: DateTime<Utc>) -> Slice {
    Slice(at.timestamp().div_euclid(3_600))
}

fn view_at(now: DateTime<Utc>, config: ViewConfig) -> (QueueView, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(now));
    let view = QueueView::with_clock(Arc::new(MemoryStore::new()), config, clock.clone()).unwrap();
    (view, clock)
}

fn manual() -> ViewConfig {
    ViewConfig {
        advance_policy: AdvancePolicy::Manual,
        ..ViewConfig::default()
    }
}

fn mail(name: &str) -> NewItem {
    NewItem::new(name, ContentRef::from("hdr"), ContentRef::from("body"))
}

async fn browse_all(view: &QueueView, queue: &QueueName) -> Vec<EnqueuedItem> {
    view.browse(queue).await.unwrap().try_collect().await.unwrap()
}

#[tokio::test]
async fn recorded_items_come_back_in_order() {
    let (view, clock) = view_at(t0(), manual());
    let queue = QueueName::from("spool");

    let mut keys = Vec::new();
    for name in ["m1", "m2", "m3"] {
        keys.push(view.record(&queue, mail(name).sender("a@example.com")).await.unwrap());
        clock.advance(Duration::seconds(1));
    }

    let items = browse_all(&view, &queue).await;
    assert_eq!(items.iter().map(|i| i.key).collect::<Vec<_>>(), keys);
    assert_eq!(items[0].name, "m1");
    assert_eq!(items[0].sender.as_deref(), Some("a@example.com"));
    assert_eq!(items[0].slice, hour_slice(t0()));
}

#[tokio::test]
async fn empty_queue_browses_to_nothing() {
    let (view, _) = view_at(t0(), ViewConfig::default());
    let queue = QueueName::from("never-written");

    let mut browse = view.browse(&queue).await.unwrap();
    let items: Vec<EnqueuedItem> = (&mut browse).try_collect().await.unwrap();

    assert!(items.is_empty());
    assert!(browse.failures().is_empty());
    assert_eq!(view.size(&queue).await.unwrap(), 0);
}

#[tokio::test]
async fn deleted_item_is_never_browsed_again() {
    let (view, _) = view_at(t0(), manual());
    let queue = QueueName::from("spool");
    let keep = view.record(&queue, mail("keep")).await.unwrap();
    let gone = view.record(&queue, mail("gone")).await.unwrap();

    let item = browse_all(&view, &queue)
        .await
        .into_iter()
        .find(|i| i.key == gone)
        .unwrap();
    view.delete_item(&item).await.unwrap();

    let keys: Vec<ItemKey> = browse_all(&view, &queue).await.iter().map(|i| i.key).collect();
    assert_eq!(keys, vec![keep]);
    assert!(view.is_deleted(&queue, gone).await.unwrap());
    assert!(!view.is_deleted(&queue, keep).await.unwrap());
}

#[tokio::test]
async fn delete_and_record_are_idempotent() {
    let (view, _) = view_at(t0(), manual());
    let queue = QueueName::from("spool");
    let key = ItemKey::at(t0());

    view.record(&queue, mail("m1").key(key)).await.unwrap();
    view.record(&queue, mail("m1").key(key)).await.unwrap();
    assert_eq!(view.size(&queue).await.unwrap(), 1);

    let slice = hour_slice(t0());
    view.delete(&queue, key, slice).await.unwrap();
    view.delete(&queue, key, slice).await.unwrap();
    assert_eq!(view.size(&queue).await.unwrap(), 0);
}

#[tokio::test]
async fn delete_in_one_slice_leaves_the_next() {
    let (view, clock) = view_at(t0() + Duration::minutes(90), manual());
    let queue = QueueName::from("spool");

    let a = view
        .record_at(&queue, mail("a"), t0() + Duration::minutes(10))
        .await
        .unwrap();
    let b = view
        .record_at(&queue, mail("b"), t0() + Duration::minutes(70))
        .await
        .unwrap();
    view.delete(&queue, a, hour_slice(t0())).await.unwrap();
    clock.advance(Duration::minutes(5));

    let items = browse_all(&view, &queue).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key, b);
    assert_eq!(items[0].slice, hour_slice(t0()).next());
}

#[tokio::test]
async fn concurrent_records_are_all_visible() {
    let config = ViewConfig {
        bucket_count: 8,
        ..manual()
    };
    let (view, _) = view_at(t0(), config);
    let view = Arc::new(view);
    let queue = QueueName::from("spool");

    let mut handles = Vec::new();
    for i in 0..100 {
        let view = Arc::clone(&view);
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            view.record(&queue, mail(&format!("m{i}"))).await.unwrap()
        }));
    }
    let mut written = HashSet::new();
    for handle in handles {
        written.insert(handle.await.unwrap());
    }

    let seen: HashSet<ItemKey> = browse_all(&view, &queue).await.iter().map(|i| i.key).collect();
    assert_eq!(written.len(), 100);
    assert_eq!(seen, written);
}

#[tokio::test]
async fn browse_start_only_moves_forward() {
    let (view, clock) = view_at(t0(), manual());
    let queue = QueueName::from("spool");
    let s = hour_slice(t0());

    let a = view.record(&queue, mail("a")).await.unwrap();
    let mut seen = vec![view.browse_start(&queue).await.unwrap().unwrap()];
    assert_eq!(seen[0], Slice(s.0 - 1));

    clock.advance(Duration::hours(10));
    view.advance_browse_start(&queue).await.unwrap();
    seen.push(view.browse_start(&queue).await.unwrap().unwrap());
    // The live item pins the start at its slice.
    assert_eq!(seen[1], s);

    view.delete(&queue, a, s).await.unwrap();
    assert_eq!(
        view.advance_browse_start(&queue).await.unwrap(),
        Advance::Advanced
    );
    seen.push(view.browse_start(&queue).await.unwrap().unwrap());
    // Nothing live left: stops one slice behind now.
    assert_eq!(seen[2], Slice(s.0 + 9));

    let late = view.record_at(&queue, mail("late"), t0()).await;
    assert!(matches!(late, Err(Error::Indexing { .. })));

    assert_eq!(
        view.advance_browse_start(&queue).await.unwrap(),
        Advance::Unchanged
    );
    seen.push(view.browse_start(&queue).await.unwrap().unwrap());

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "regressed: {seen:?}");
}

#[tokio::test]
async fn eager_policy_advances_on_delete() {
    let config = ViewConfig {
        advance_policy: AdvancePolicy::Eager,
        ..ViewConfig::default()
    };
    let (view, clock) = view_at(t0(), config);
    let queue = QueueName::from("spool");
    let s = hour_slice(t0());

    let a = view.record(&queue, mail("a")).await.unwrap();
    clock.advance(Duration::hours(3));
    let b = view.record(&queue, mail("b")).await.unwrap();
    clock.advance(Duration::hours(3));

    // `a` is still live and pins the start at its slice.
    view.delete(&queue, b, Slice(s.0 + 3)).await.unwrap();
    assert_eq!(view.browse_start(&queue).await.unwrap(), Some(s));

    view.delete(&queue, a, s).await.unwrap();
    assert_eq!(view.browse_start(&queue).await.unwrap(), Some(Slice(s.0 + 5)));
}

#[tokio::test]
async fn delete_matching_removes_only_matches() {
    let (view, _) = view_at(t0(), manual());
    let queue = QueueName::from("spool");
    view.record(&queue, mail("m1").sender("spam@example.com"))
        .await
        .unwrap();
    view.record(&queue, mail("m2").sender("ham@example.com"))
        .await
        .unwrap();
    view.record(&queue, mail("m3").sender("spam@example.com"))
        .await
        .unwrap();

    let deleted = view
        .delete_matching(&queue, &ItemFilter::Sender("spam@example.com".into()))
        .await
        .unwrap();

    assert_eq!(deleted, 2);
    let names: Vec<String> = browse_all(&view, &queue).await.into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["m2".to_string()]);
}

#[tokio::test]
async fn detailed_browse_reports_missing_content_per_item() {
    let (view, _) = view_at(t0(), manual());
    let queue = QueueName::from("spool");
    let blobs = Arc::new(MemoryBlobStore::new());

    let header = blobs.put(b"Subject: hello".to_vec()).await.unwrap();
    let body = blobs.put(b"hi there".to_vec()).await.unwrap();
    view.record(&queue, NewItem::new("whole", header, body))
        .await
        .unwrap();
    view.record(
        &queue,
        NewItem::new("gone", ContentRef::from("missing-h"), ContentRef::from("missing-b")),
    )
    .await
    .unwrap();

    let browse = view.browse_detailed(&queue, blobs.clone()).await.unwrap();
    let results: Vec<_> = browse.collect().await;

    assert_eq!(results.len(), 2);
    let details: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].item.name, "whole");
    assert_eq!(details[0].header, b"Subject: hello");
    assert_eq!(details[0].body, b"hi there");
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(Error::ContentMissing(_))))
    );
}

#[tokio::test]
async fn enqueue_hands_off_then_indexes() {
    let (view, _) = view_at(t0(), manual());
    let queue = QueueName::from("spool");
    let transport = MemoryTransport::new();

    let enqueued = view
        .enqueue(&transport, &queue, mail("m1").recipient("bob@example.com"))
        .await
        .unwrap();

    assert!(enqueued.is_indexed());
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].key, enqueued.key());
    assert_eq!(sent[0].queue, queue);

    let items = browse_all(&view, &queue).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key, enqueued.key());
    assert_eq!(items[0].recipients, vec!["bob@example.com".to_string()]);
}

#[tokio::test]
async fn dropping_a_browse_midway_is_harmless() {
    let config = ViewConfig {
        page_size: 2,
        ..manual()
    };
    let (view, clock) = view_at(t0(), config);
    let queue = QueueName::from("spool");
    for i in 0..10 {
        view.record(&queue, mail(&format!("m{i}"))).await.unwrap();
        clock.advance(Duration::seconds(1));
    }

    let mut browse = view.browse(&queue).await.unwrap();
    let first = browse.try_next().await.unwrap().unwrap();
    drop(browse);

    assert_eq!(first.name, "m0");
    assert_eq!(view.size(&queue).await.unwrap(), 10);
}
