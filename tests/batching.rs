//! Count and interval flushing of buffered values, on a paused clock

mod common;

use chrono::{TimeZone, Utc};
use common::open_cache;
use sluice::cache::{ContentType, Tier, TierLimits};
use sluice::{BatchAssembler, BatchSettings, CancellationToken, TimeValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn values(n: usize) -> Vec<TimeValue> {
    let ts = Utc.with_ymd_and_hms(2024, 2, 16, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| TimeValue::new("temp", ts, serde_json::json!({ "value": i })))
        .collect()
}

fn settings(group_count: usize, send_interval: Duration) -> BatchSettings {
    BatchSettings {
        group_count,
        send_interval,
        ..BatchSettings::default()
    }
}

fn item_counts(cache: &sluice::ContentCache) -> Vec<Option<u64>> {
    cache
        .pending()
        .unwrap()
        .into_iter()
        .map(|entry| entry.metadata.item_count)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn group_count_flushes_before_the_timer() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path(), TierLimits::unlimited());
    let assembler = Arc::new(BatchAssembler::new(
        Arc::clone(&cache),
        settings(100, Duration::from_secs(10)),
    ));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&assembler).run(cancel.clone()));
    tokio::task::yield_now().await;

    let mut incoming = values(120);
    let rest = incoming.split_off(100);
    let last = incoming.split_off(99);
    assert!(assembler.add_values(incoming).unwrap().is_empty());
    assert_eq!(assembler.add_values(last).unwrap().len(), 1);
    assert!(assembler.add_values(rest).unwrap().is_empty());
    assert_eq!(item_counts(&cache), vec![Some(100)]);
    assert_eq!(assembler.buffered_values().unwrap(), 20);

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(item_counts(&cache), vec![Some(100)]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(item_counts(&cache), vec![Some(100), Some(20)]);
    assert_eq!(assembler.buffered_values().unwrap(), 0);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancellation_flushes_what_is_buffered() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path(), TierLimits::unlimited());
    let assembler = Arc::new(BatchAssembler::new(
        Arc::clone(&cache),
        settings(100, Duration::from_secs(60)),
    ));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&assembler).run(cancel.clone()));

    assembler.add_values(values(5)).unwrap();
    cancel.cancel();
    tokio_test::assert_ok!(task.await.unwrap());

    assert_eq!(item_counts(&cache), vec![Some(5)]);
    let entry = &cache.pending().unwrap()[0];
    assert_eq!(entry.metadata.content_type, ContentType::TimeValues);
    let stored: Vec<TimeValue> =
        serde_json::from_slice(&cache.read_payload(Tier::Cache, &entry.id).unwrap()).unwrap();
    assert_eq!(stored, values(5));
}

#[tokio::test(start_paused = true)]
async fn queued_files_wait_for_the_interval() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("export.csv");
    std::fs::write(&source, "ts,value\n").unwrap();
    let cache = open_cache(&dir.path().join("cache"), TierLimits::unlimited());
    let assembler = Arc::new(BatchAssembler::new(
        Arc::clone(&cache),
        BatchSettings {
            send_file_immediately: false,
            ..settings(100, Duration::from_secs(10))
        },
    ));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&assembler).run(cancel.clone()));
    tokio::task::yield_now().await;

    assert!(assembler.add_file(&source).unwrap().is_none());
    assert_eq!(assembler.queued_files().unwrap(), 1);
    assert!(cache.pending().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(11)).await;
    let pending = cache.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name(), "export.csv");

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn flush_wakes_the_delivery_side() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path(), TierLimits::unlimited());
    let waker = Arc::new(Notify::new());
    let assembler = BatchAssembler::new(Arc::clone(&cache), settings(2, Duration::ZERO))
        .with_flush_hook(Arc::clone(&waker));

    assembler.add_values(values(1)).unwrap();
    assembler.add_values(values(1)).unwrap();

    // notify_one stores a permit when nobody is waiting yet
    tokio::time::timeout(Duration::from_secs(1), waker.notified())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn full_cache_holds_the_batch_across_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let limits = TierLimits {
        cache: Some(10),
        ..TierLimits::unlimited()
    };
    let cache = open_cache(dir.path(), limits);
    let assembler = Arc::new(BatchAssembler::new(
        Arc::clone(&cache),
        settings(100, Duration::from_secs(1)),
    ));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&assembler).run(cancel.clone()));

    assembler.add_values(values(1)).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!task.is_finished());
    assert_eq!(assembler.buffered_values().unwrap(), 1);
    assert!(cache.pending().unwrap().is_empty());

    cancel.cancel();
    tokio_test::assert_ok!(task.await.unwrap());
    assert_eq!(assembler.buffered_values().unwrap(), 1);
}
