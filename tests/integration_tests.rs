//! Integration tests for the streaming pipeline.
//! These tests run sources, workers, the coordinator and the emitter together
//! over the in-memory transport.

use rust_decimal::Decimal;
use rust_tradewatch::config::AppConfig;
use rust_tradewatch::engine::checkpoint::{Checkpoint, CheckpointStore, WorkerCheckpoint};
use rust_tradewatch::engine::watermark::PartitionProgress;
use rust_tradewatch::engine::window::{WindowAggregate, WindowKey, WindowSnapshot};
use rust_tradewatch::engine::{Pipeline, PipelineReport};
use rust_tradewatch::error::PipelineError;
use rust_tradewatch::events::{Event, TradeEvent, WindowId};
use rust_tradewatch::transport::memory::{MemoryAlertSink, MemoryTopic};
use rust_tradewatch::transport::TradeSource;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const BASE: i64 = 1_700_000_000_000;

fn trade(symbol: &str, qty: &str, t: i64, id: &str) -> String {
    format!(
        r#"{{"symbol":"{}","price":"100","quantity":"{}","event_time":{},"trade_id":"{}"}}"#,
        symbol, qty, t, id
    )
}

fn test_config(checkpoint: Option<PathBuf>) -> AppConfig {
    let mut config = AppConfig::default();
    config.bounded_out_of_orderness_ms = 0;
    config.checkpoint.path = checkpoint;
    config.max_publish_retries = 1;
    config.emitter.retry_base_delay_ms = 1;
    config.emitter.retry_max_delay_ms = 5;
    config.ingress.read_retry_base_delay_ms = 1;
    config
}

fn sources(topic: &MemoryTopic, assignment: &[&[u32]]) -> Vec<Box<dyn TradeSource>> {
    assignment
        .iter()
        .map(|partitions| Box::new(topic.consumer(partitions.to_vec())) as Box<dyn TradeSource>)
        .collect()
}

async fn run(
    pipeline: Pipeline,
    topic: &MemoryTopic,
    assignment: &[&[u32]],
    sink: &MemoryAlertSink,
) -> Result<PipelineReport, PipelineError> {
    tokio::time::timeout(
        Duration::from_secs(10),
        pipeline.run(sources(topic, assignment), Arc::new(sink.clone())),
    )
    .await
    .expect("pipeline did not finish")
}

async fn alerts(sink: &MemoryAlertSink) -> Vec<Value> {
    sink.payloads()
        .await
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect()
}

/// Three BTCUSDT trades in one window, volume 120 against threshold 100
#[tokio::test]
async fn test_volume_spike_raises_single_warn_alert() {
    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("BTCUSDT", "40", BASE + 1_000, "1")).unwrap();
    topic.append(0, trade("BTCUSDT", "50", BASE + 4_000, "2")).unwrap();
    topic.append(0, trade("BTCUSDT", "30", BASE + 9_000, "3")).unwrap();
    topic.close();

    let sink = MemoryAlertSink::new();
    let report = run(Pipeline::new(test_config(None)), &topic, &[&[0]], &sink)
        .await
        .unwrap();

    assert_eq!(
        alerts(&sink).await,
        vec![json!({
            "symbol": "BTCUSDT",
            "window_start": BASE,
            "window_end": BASE + 10_000,
            "metric": "volume",
            "observed_value": 120.0,
            "threshold": 100.0,
            "severity": "WARN"
        })]
    );
    assert_eq!(report.metrics.windows_done, 1);
    assert_eq!(report.metrics.alerts_published, 1);
    assert_eq!(report.drained_workers, 1);
}

#[tokio::test]
async fn test_quiet_window_raises_nothing() {
    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("BTCUSDT", "10", BASE + 1_000, "1")).unwrap();
    topic.append(0, trade("BTCUSDT", "20", BASE + 2_000, "2")).unwrap();
    topic.close();

    let sink = MemoryAlertSink::new();
    let report = run(Pipeline::new(test_config(None)), &topic, &[&[0]], &sink)
        .await
        .unwrap();

    assert!(sink.published().await.is_empty());
    assert_eq!(report.metrics.windows_done, 1);
}

#[tokio::test]
async fn test_critical_severity() {
    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("ETHUSDT", "250", BASE, "1")).unwrap();
    topic.close();

    let sink = MemoryAlertSink::new();
    run(Pipeline::new(test_config(None)), &topic, &[&[0]], &sink)
        .await
        .unwrap();

    let alerts = alerts(&sink).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["severity"], "CRITICAL");
}

/// Shuffled delivery across two partitions and two workers gives the same
/// alerts as in-order delivery on one worker.
#[tokio::test]
async fn test_results_independent_of_arrival_order_and_workers() {
    let trades = vec![
        trade("BTCUSDT", "40", BASE + 1_000, "b1"),
        trade("BTCUSDT", "50", BASE + 4_000, "b2"),
        trade("ETHUSDT", "70", BASE + 5_000, "e1"),
        trade("BTCUSDT", "30", BASE + 9_000, "b3"),
        trade("ETHUSDT", "45", BASE + 12_000, "e2"),
        trade("BTCUSDT", "99", BASE + 13_000, "b4"),
        trade("ETHUSDT", "60", BASE + 18_000, "e3"),
        trade("BTCUSDT", "5", BASE + 21_000, "b5"),
    ];

    let mut config = test_config(None);
    config.bounded_out_of_orderness_ms = 60_000;

    let ordered = MemoryTopic::new("trades.raw", 1);
    for t in &trades {
        ordered.append(0, t.clone()).unwrap();
    }
    ordered.close();
    let ordered_sink = MemoryAlertSink::new();
    run(Pipeline::new(config.clone()), &ordered, &[&[0]], &ordered_sink)
        .await
        .unwrap();

    let shuffled = MemoryTopic::new("trades.raw", 2);
    for (i, idx) in [7usize, 3, 5, 0, 6, 2, 4, 1].iter().enumerate() {
        shuffled.append((i % 2) as u32, trades[*idx].clone()).unwrap();
    }
    shuffled.close();
    let shuffled_sink = MemoryAlertSink::new();
    let report = run(Pipeline::new(config), &shuffled, &[&[0], &[1]], &shuffled_sink)
        .await
        .unwrap();

    let mut expected = ordered_sink.payloads().await;
    let mut actual = shuffled_sink.payloads().await;
    expected.sort();
    actual.sort();
    assert_eq!(actual, expected);
    // BTC@0 (120), ETH@10000 (105), BTC@10000 (99 is quiet), ETH@0 (70 is quiet)
    assert_eq!(actual.len(), 2);
    assert_eq!(report.drained_workers, 2);
}

#[tokio::test]
async fn test_duplicate_trade_ids_count_once() {
    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("BTCUSDT", "60", BASE + 1_000, "same")).unwrap();
    topic.append(0, trade("BTCUSDT", "60", BASE + 1_000, "same")).unwrap();
    topic.close();

    let sink = MemoryAlertSink::new();
    let report = run(Pipeline::new(test_config(None)), &topic, &[&[0]], &sink)
        .await
        .unwrap();

    assert!(sink.published().await.is_empty());
    assert_eq!(report.metrics.dropped_duplicate, 1);
}

#[tokio::test]
async fn test_invalid_records_are_skipped() {
    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, "{oops").unwrap();
    topic.append(0, trade("BTCUSDT", "0", BASE, "zero")).unwrap();
    topic.append(0, trade("BTCUSDT", "150", BASE, "ok")).unwrap();
    topic.close();

    let sink = MemoryAlertSink::new();
    let report = run(Pipeline::new(test_config(None)), &topic, &[&[0]], &sink)
        .await
        .unwrap();

    assert_eq!(report.metrics.dropped_invalid, 2);
    assert_eq!(sink.published().await.len(), 1);
}

#[tokio::test]
async fn test_late_events_go_to_side_channel() {
    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("BTCUSDT", "30", BASE + 1_000, "a")).unwrap();
    topic.append(0, trade("BTCUSDT", "30", BASE + 15_000, "b")).unwrap();
    // Window [BASE, BASE+10s) already closed at watermark BASE+15s
    topic.append(0, trade("BTCUSDT", "500", BASE + 2_000, "late")).unwrap();
    topic.close();

    let pipeline = Pipeline::new(test_config(None));
    let mut bus = pipeline.bus().subscribe();
    let sink = MemoryAlertSink::new();
    let report = run(pipeline, &topic, &[&[0]], &sink).await.unwrap();

    assert!(sink.published().await.is_empty());
    assert_eq!(report.metrics.dropped_late, 1);
    assert_eq!(report.metrics.late_by_symbol.get("BTCUSDT"), Some(&1));

    let mut late_ids = Vec::new();
    while let Ok(event) = bus.try_recv() {
        if let Event::LateTrade { trade, .. } = event {
            late_ids.push(trade.trade_id);
        }
    }
    assert_eq!(late_ids, vec!["late"]);
}

#[tokio::test]
async fn test_allowed_lateness_admits_stragglers() {
    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("BTCUSDT", "60", BASE + 1_000, "a")).unwrap();
    topic.append(0, trade("BTCUSDT", "1", BASE + 12_000, "b")).unwrap();
    // Behind the watermark but within the lateness horizon (BASE+7s)
    topic.append(0, trade("BTCUSDT", "60", BASE + 8_000, "straggler")).unwrap();
    topic.close();

    let mut config = test_config(None);
    config.allowed_lateness_ms = 5_000;
    let sink = MemoryAlertSink::new();
    let report = run(Pipeline::new(config), &topic, &[&[0]], &sink).await.unwrap();

    assert_eq!(report.metrics.dropped_late, 0);
    let alerts = alerts(&sink).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["observed_value"], 120.0);
}

#[tokio::test]
async fn test_publish_failure_does_not_block_later_alerts() {
    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("BTCUSDT", "150", BASE + 1_000, "a")).unwrap();
    topic.append(0, trade("BTCUSDT", "150", BASE + 11_000, "b")).unwrap();
    topic.close();

    let sink = MemoryAlertSink::new();
    // First alert burns both of its attempts
    sink.fail_next(2);
    let report = run(Pipeline::new(test_config(None)), &topic, &[&[0]], &sink)
        .await
        .unwrap();

    let alerts = alerts(&sink).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["window_start"], BASE + 10_000);
    assert_eq!(report.metrics.publish_failures, 1);
    assert!(report.metrics.alerting_degraded());
}

#[tokio::test]
async fn test_read_failures_halt_pipeline() {
    let topic = MemoryTopic::new("trades.raw", 1);
    topic.fail_next_reads(u32::MAX);

    let sink = MemoryAlertSink::new();
    match run(Pipeline::new(test_config(None)), &topic, &[&[0]], &sink).await {
        Err(PipelineError::WorkerFailed { worker, .. }) => assert_eq!(worker, 0),
        other => panic!("Expected worker failure, got {:?}", other.map(|r| r.drained_workers)),
    }
}

fn window(symbol: &str, window_start: i64, qty: i64) -> WindowSnapshot {
    let trade = TradeEvent {
        symbol: symbol.to_string(),
        price: Decimal::from(100),
        quantity: Decimal::from(qty),
        event_time: window_start,
        trade_id: "seed".to_string(),
    };
    WindowSnapshot {
        key: WindowKey::for_event(symbol, window_start, 10_000),
        aggregate: WindowAggregate::from_trade(&trade),
    }
}

fn restored_checkpoint(done: Vec<WindowId>) -> Checkpoint {
    let mut offsets = BTreeMap::new();
    offsets.insert(0, 3);
    let mut progress = BTreeMap::new();
    progress.insert(
        0,
        PartitionProgress {
            max_event_time: Some(BASE + 12_000),
            finished: false,
        },
    );
    Checkpoint::new(
        7,
        vec![WorkerCheckpoint {
            worker_id: 0,
            offsets,
            progress,
            open_windows: vec![window("BTCUSDT", BASE, 120)],
            ..Default::default()
        }],
        done,
    )
}

/// A window restored OPEN whose close point the restored watermark already
/// passed is evaluated exactly once.
#[tokio::test]
async fn test_restore_forces_closing_window_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    CheckpointStore::new(&path)
        .save(&restored_checkpoint(Vec::new()))
        .await
        .unwrap();

    let topic = MemoryTopic::new("trades.raw", 1);
    for i in 0..3 {
        topic
            .append(0, trade("BTCUSDT", "999", BASE + 1_000, &format!("old-{}", i)))
            .unwrap();
    }
    topic.close();

    let sink = MemoryAlertSink::new();
    let report = run(Pipeline::new(test_config(Some(path.clone()))), &topic, &[&[0]], &sink)
        .await
        .unwrap();

    let alerts = alerts(&sink).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["observed_value"], 120.0);
    // Records before the checkpoint offset are not re-read
    assert_eq!(report.metrics.records_received, 0);

    let last = CheckpointStore::new(&path).load().await.unwrap().unwrap();
    assert!(last.epoch > 7);
    assert!(last.done_windows.contains(&WindowId {
        symbol: "BTCUSDT".to_string(),
        window_start: BASE,
    }));
    assert_eq!(topic.committed(0), Some(3));
}

#[tokio::test]
async fn test_restore_skips_windows_already_done() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    let done = vec![WindowId {
        symbol: "BTCUSDT".to_string(),
        window_start: BASE,
    }];
    CheckpointStore::new(&path)
        .save(&restored_checkpoint(done))
        .await
        .unwrap();

    let topic = MemoryTopic::new("trades.raw", 1);
    topic.close();

    let sink = MemoryAlertSink::new();
    let report = run(Pipeline::new(test_config(Some(path))), &topic, &[&[0]], &sink)
        .await
        .unwrap();

    assert!(sink.published().await.is_empty());
    assert_eq!(report.metrics.windows_skipped_done, 1);
}

#[tokio::test]
async fn test_corrupt_checkpoint_halts_unless_cold_start() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    std::fs::write(&path, "not json").unwrap();

    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("BTCUSDT", "150", BASE, "a")).unwrap();
    topic.close();
    let sink = MemoryAlertSink::new();

    let halted = run(Pipeline::new(test_config(Some(path.clone()))), &topic, &[&[0]], &sink).await;
    assert!(matches!(halted, Err(PipelineError::StateCorruption(_))));

    let mut config = test_config(Some(path));
    config.checkpoint.cold_start_on_corruption = true;
    run(Pipeline::new(config), &topic, &[&[0]], &sink).await.unwrap();
    assert_eq!(sink.published().await.len(), 1);
}

/// Cancel mid-stream, then resume from the final checkpoint: the window that
/// straddles the restart is evaluated once with its full volume.
#[tokio::test]
async fn test_cancel_and_resume_is_exactly_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");

    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("BTCUSDT", "40", BASE + 1_000, "1")).unwrap();
    topic.append(0, trade("BTCUSDT", "50", BASE + 4_000, "2")).unwrap();

    let sink = MemoryAlertSink::new();
    let pipeline = Pipeline::new(test_config(Some(path.clone())));
    let metrics = pipeline.metrics();
    let cancel = pipeline.cancel_token();
    let first = {
        let topic = topic.clone();
        let sink = sink.clone();
        tokio::spawn(async move { run(pipeline, &topic, &[&[0]], &sink).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while metrics.events_applied.load(Ordering::Relaxed) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.drained_workers, 0);
    assert!(sink.published().await.is_empty());

    let saved = CheckpointStore::new(&path).load().await.unwrap().unwrap();
    assert_eq!(saved.workers[0].open_windows.len(), 1);
    assert_eq!(saved.workers[0].offsets.get(&0), Some(&2));
    assert_eq!(topic.committed(0), Some(2));

    // Rest of the window arrives after the restart
    topic.append(0, trade("BTCUSDT", "30", BASE + 9_000, "3")).unwrap();
    // Re-delivery of a trade seen before the restart
    topic.append(0, trade("BTCUSDT", "50", BASE + 4_000, "2")).unwrap();
    topic.close();

    let report = run(Pipeline::new(test_config(Some(path))), &topic, &[&[0]], &sink)
        .await
        .unwrap();

    let alerts = alerts(&sink).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["observed_value"], 120.0);
    assert_eq!(report.metrics.dropped_duplicate, 1);
}

#[tokio::test]
async fn test_periodic_checkpoints_commit_offsets() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    let mut config = test_config(Some(path.clone()));
    config.checkpoint_interval_ms = 20;

    let topic = MemoryTopic::new("trades.raw", 2);
    topic.append(0, trade("BTCUSDT", "1", BASE, "a")).unwrap();
    topic.append(1, trade("ETHUSDT", "1", BASE, "b")).unwrap();

    let pipeline = Pipeline::new(config);
    let metrics = pipeline.metrics();
    let cancel = pipeline.cancel_token();
    let sink = MemoryAlertSink::new();
    let handle = {
        let topic = topic.clone();
        let sink = sink.clone();
        tokio::spawn(async move { run(pipeline, &topic, &[&[0], &[1]], &sink).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while metrics.checkpoints_written.load(Ordering::Relaxed) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(topic.committed(0), Some(1));
    assert_eq!(topic.committed(1), Some(1));
    let saved = CheckpointStore::new(&path).load().await.unwrap().unwrap();
    assert_eq!(saved.workers.len(), 2);
}

/// The sink is down and the process dies mid-retry: the alert of the finished
/// window lives on in the checkpoint and is delivered after the restart.
#[tokio::test]
async fn test_unacknowledged_alert_survives_crash() {
    let dir = tempdir().unwrap();
    let live = dir.path().join("checkpoint.json");
    let crashed = dir.path().join("crashed.json");

    let topic = MemoryTopic::new("trades.raw", 1);
    topic.append(0, trade("BTCUSDT", "150", BASE, "a")).unwrap();
    topic.append(0, trade("BTCUSDT", "1", BASE + 20_000, "b")).unwrap();

    let mut config = test_config(Some(live.clone()));
    config.checkpoint_interval_ms = 20;
    config.max_publish_retries = 50;
    config.emitter.retry_base_delay_ms = 1_000;
    config.emitter.retry_max_delay_ms = 1_000;

    let down = MemoryAlertSink::new();
    down.fail_always();
    let first = {
        let topic = topic.clone();
        let down = down.clone();
        tokio::spawn(async move { run(Pipeline::new(config), &topic, &[&[0]], &down).await })
    };

    // Wait for a checkpoint taken after the window finished
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Some(cp)) = CheckpointStore::new(&live).load().await {
                if !cp.done_windows.is_empty() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    std::fs::copy(&live, &crashed).unwrap();
    first.abort();
    assert!(down.published().await.is_empty());

    let saved = CheckpointStore::new(&crashed).load().await.unwrap().unwrap();
    assert_eq!(saved.pending_alerts.len(), 1);

    topic.close();
    let healthy = MemoryAlertSink::new();
    run(Pipeline::new(test_config(Some(crashed.clone()))), &topic, &[&[0]], &healthy)
        .await
        .unwrap();

    let alerts = alerts(&healthy).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["window_start"], BASE);
    assert_eq!(alerts[0]["observed_value"], 150.0);

    let last = CheckpointStore::new(&crashed).load().await.unwrap().unwrap();
    assert!(last.pending_alerts.is_empty());
}

/// A failing sink with a one-slot alert queue still lets every window finish
/// while the emitter is busy retrying.
#[tokio::test]
async fn test_failing_sink_does_not_stall_evaluation() {
    let topic = MemoryTopic::new("trades.raw", 1);
    for i in 0..6 {
        topic
            .append(0, trade("BTCUSDT", "150", BASE + i * 10_000, &format!("t{}", i)))
            .unwrap();
    }
    topic.close();

    let mut config = test_config(None);
    config.emitter.queue_size = 1;
    config.max_publish_retries = 2;
    config.emitter.retry_base_delay_ms = 100;
    config.emitter.retry_max_delay_ms = 100;

    let sink = MemoryAlertSink::new();
    sink.fail_always();
    let pipeline = Pipeline::new(config);
    let metrics = pipeline.metrics();
    let handle = {
        let topic = topic.clone();
        let sink = sink.clone();
        tokio::spawn(async move { run(pipeline, &topic, &[&[0]], &sink).await })
    };

    tokio::time::timeout(Duration::from_millis(500), async {
        while metrics.windows_done.load(Ordering::Relaxed) < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("windows should finish while alerts are still retrying");
    assert!(metrics.publish_failures.load(Ordering::Relaxed) < 6);

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.metrics.alerts_raised, 6);
    assert_eq!(report.metrics.publish_failures, 6);
    assert!(sink.published().await.is_empty());
}
