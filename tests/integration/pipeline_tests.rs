//! End-to-end pipeline tests
//!
//! Each test runs a full coordinator (schedulers, workers, storers, monitor,
//! heartbeat) against an in-memory or SQLite seed store with short timings.

use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use sumi_sluice::config::{parse_config, Config};
use sumi_sluice::crawler::{Attempt, Coordinator, IterSource, Passthrough, Worker, Yield};
use sumi_sluice::output::{OutputError, OutputResult, SinkBackend, SqliteSink};
use sumi_sluice::state::{Item, PipelineContext, Seed};
use sumi_sluice::storage::{DurableStore, MemorySeedStore, SqliteSeedStore};
use tempfile::TempDir;

fn config(max_retries: u32, batch: usize, idle_mode: &str) -> Config {
    parse_config(&format!(
        r#"
[pipeline]
workers = 3
schedulers = 1
max-retries = {max_retries}
scheduler-size-cap = 1000
queue-length-threshold = 10
sink-batch-length = {batch}
idle-mode = "{idle_mode}"

[timing]
poll-wait = 5
poll-block = 10
seed-backoff = 10
sink-backoff = 5
monitor-grace = 0
monitor-interval = 20
settle-delay = 50
idle-wait = 20
heartbeat-interval = 50

[store]
database-path = "seeds.db"

[sink]
database-path = "items.db"
destinations = ["articles"]
"#
    ))
    .unwrap()
}

/// Sink that records batches and fails a fixed number of times first
#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<Vec<Item>>>,
    failures: AtomicUsize,
}

impl RecordingSink {
    fn failing(times: usize) -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(times),
        }
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }
}

impl SinkBackend for RecordingSink {
    fn store(&self, items: &[Item]) -> OutputResult<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(OutputError::Write("sink unavailable".to_string()));
        }
        self.batches.lock().unwrap().push(items.to_vec());
        Ok(())
    }
}

fn outcome(value: bool) -> Vec<anyhow::Result<Yield>> {
    vec![Ok(Yield::Outcome(value))]
}

#[test]
fn test_successful_seed_is_acknowledged_once() {
    let store = Arc::new(MemorySeedStore::with_seeds(["a"]));
    let sink = Arc::new(RecordingSink::default());

    let report = Coordinator::new(
        config(3, 10, "finite"),
        store.clone(),
        Arc::new(|_: &Seed| outcome(true)),
    )
    .with_sink("articles", sink.clone())
    .run()
    .unwrap();

    assert_eq!(store.ack_count("a"), 1);
    assert_eq!(store.reset_count("a"), 0);
    assert_eq!(report.counters.succeeded, 1);
    assert_eq!(report.counters.retried, 0);
    assert!(sink.batch_sizes().is_empty());
}

#[test]
fn test_empty_extraction_is_requeued_with_one_retry() {
    let store = Arc::new(MemorySeedStore::with_seeds(["a"]));
    let ctx = Arc::new(PipelineContext::new(["articles"]));
    let worker = Worker::new(
        0,
        ctx.clone(),
        store.clone(),
        Arc::new(|_: &Seed| Vec::<anyhow::Result<Yield>>::new()),
        &config(3, 10, "finite"),
    );

    let seed = store.pull_ready(1).unwrap().remove(0);
    assert_eq!(worker.process_seed(seed), Attempt::Retried(1));

    let requeued = ctx.seeds().pop().unwrap();
    assert_eq!(requeued.payload, "a");
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(ctx.in_flight(), 0);
}

#[test]
fn test_errors_then_success_acknowledges_with_retry_count() {
    let store = Arc::new(MemorySeedStore::with_seeds(["c"]));
    let calls = Arc::new(AtomicU32::new(0));
    let acked_at = Arc::new(Mutex::new(None));

    let extractor = {
        let calls = Arc::clone(&calls);
        let acked_at = Arc::clone(&acked_at);
        move |seed: &Seed| -> Vec<anyhow::Result<Yield>> {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                return vec![Err(anyhow::anyhow!("transient failure"))];
            }
            *acked_at.lock().unwrap() = Some(seed.retry_count);
            outcome(true)
        }
    };

    let report = Coordinator::new(config(5, 10, "finite"), store.clone(), Arc::new(extractor))
        .with_sink("articles", Arc::new(RecordingSink::default()))
        .run()
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*acked_at.lock().unwrap(), Some(2));
    assert_eq!(store.ack_count("c"), 1);
    assert_eq!(report.counters.retried, 2);
    assert_eq!(report.counters.succeeded, 1);
}

#[test]
fn test_partial_batch_flushed_on_drain() {
    let store = Arc::new(MemorySeedStore::with_seeds(["a"]));
    let sink = Arc::new(RecordingSink::default());
    let extractor = |_: &Seed| -> Vec<anyhow::Result<Yield>> {
        (0..5)
            .map(|n| Ok(Yield::Item(Item::new("articles", json!({ "n": n })))))
            .collect()
    };

    let report = Coordinator::new(config(3, 3, "finite"), store.clone(), Arc::new(extractor))
        .with_sink("articles", sink.clone())
        .run()
        .unwrap();

    assert_eq!(sink.batch_sizes(), vec![3, 2]);
    assert_eq!(report.counters.items_stored, 5);
    assert_eq!(store.ack_count("a"), 1);
}

#[test]
fn test_finite_mode_stops_promptly_when_idle() {
    let started = Instant::now();
    let report = Coordinator::new(
        config(3, 10, "finite"),
        Arc::new(MemorySeedStore::new()),
        Arc::new(Passthrough::new("articles")),
    )
    .with_sink("articles", Arc::new(RecordingSink::default()))
    .run()
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.counters.dispatched, 0);
}

#[test]
fn test_long_running_mode_waits_for_external_stop() {
    let coordinator = Coordinator::new(
        config(3, 10, "long-running"),
        Arc::new(MemorySeedStore::new()),
        Arc::new(Passthrough::new("articles")),
    )
    .with_sink("articles", Arc::new(RecordingSink::default()));
    let ctx = coordinator.context();

    let handle = thread::spawn(move || coordinator.run());
    thread::sleep(Duration::from_millis(400));
    assert!(!ctx.is_stopped());

    ctx.raise_stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_store_failure_then_retry_acknowledges_once() {
    let store = Arc::new(MemorySeedStore::with_seeds(["a"]));
    let sink = Arc::new(RecordingSink::failing(1));

    let report = Coordinator::new(
        config(3, 1, "finite"),
        store.clone(),
        Arc::new(Passthrough::new("articles")),
    )
    .with_sink("articles", sink.clone())
    .run()
    .unwrap();

    assert_eq!(store.ack_count("a"), 1);
    assert_eq!(store.reset_count("a"), 1);
    assert_eq!(sink.batch_sizes(), vec![1]);
    assert_eq!(report.counters.batches_failed, 1);
}

#[test]
fn test_exhausted_seed_is_dropped_after_max_retries() {
    let store = Arc::new(MemorySeedStore::with_seeds(["bad"]));
    let calls = Arc::new(AtomicU32::new(0));
    let extractor = {
        let calls = Arc::clone(&calls);
        move |_: &Seed| -> Vec<anyhow::Result<Yield>> {
            calls.fetch_add(1, Ordering::SeqCst);
            outcome(false)
        }
    };

    let report = Coordinator::new(config(3, 10, "finite"), store.clone(), Arc::new(extractor))
        .with_sink("articles", Arc::new(RecordingSink::default()))
        .run()
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.counters.dropped, 1);
    let failed = store.failed_seeds();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 3);
    assert_eq!(store.total_acks(), 0);
}

#[test]
fn test_follow_ups_are_processed() {
    let store = Arc::new(MemorySeedStore::with_seeds(["root"]));
    let extractor = |seed: &Seed| -> Vec<anyhow::Result<Yield>> {
        let mut yields = vec![Ok(Yield::Item(Item::new("articles", json!(seed.payload))))];
        if seed.payload == "root" {
            yields.push(Ok(Yield::from(vec![Seed::new("child-1"), Seed::new("child-2")])));
        }
        yields
    };
    let sink = Arc::new(RecordingSink::default());

    let report = Coordinator::new(config(3, 10, "finite"), store.clone(), Arc::new(extractor))
        .with_sink("articles", sink.clone())
        .run()
        .unwrap();

    assert_eq!(report.counters.succeeded, 3);
    assert_eq!(report.counters.follow_ups, 2);
    assert_eq!(report.counters.items_stored, 3);
    assert_eq!(store.ack_count("root"), 1);
}

#[test]
fn test_nothing_is_enqueued_after_stop() {
    let store = Arc::new(MemorySeedStore::with_seeds(["a", "b", "c"]));
    let coordinator = Coordinator::new(
        config(3, 10, "finite"),
        store.clone(),
        Arc::new(Passthrough::new("articles")),
    )
    .with_sink("articles", Arc::new(RecordingSink::default()));
    let ctx = coordinator.context();

    coordinator.run().unwrap();

    assert!(ctx.is_stopped());
    assert!(!ctx.enqueue_seed(Seed::new("late")));
    assert!(ctx.seeds().is_empty());
    assert_eq!(ctx.sink_occupancy(), 0);
    assert_eq!(ctx.in_flight(), 0);
    assert_eq!(ctx.ledger().pending(), 0);
    assert_eq!(store.total_acks(), 3);
}

#[test]
fn test_queues_never_grow_during_live_shutdown() {
    let payloads: Vec<String> = (0..500).map(|n| format!("seed-{}", n)).collect();
    let store = Arc::new(MemorySeedStore::with_seeds(payloads));
    let extractor = |seed: &Seed| -> Vec<anyhow::Result<Yield>> {
        thread::sleep(Duration::from_millis(2));
        vec![
            Ok(Yield::Item(Item::new("articles", json!(seed.payload)))),
            Ok(Yield::Item(Item::new("articles", json!({"copy": seed.payload})))),
            Ok(Yield::from(format!("{}/next", seed.payload))),
        ]
    };
    let coordinator = Coordinator::new(
        config(3, 5, "long-running"),
        store.clone(),
        Arc::new(extractor),
    )
    .with_sink("articles", Arc::new(RecordingSink::default()));
    let ctx = coordinator.context();
    let handle = thread::spawn(move || coordinator.run());

    // Let the pipeline get busy, then stop it from outside
    thread::sleep(Duration::from_millis(150));
    assert!(ctx.seeds().len() + ctx.sink_occupancy() > 0 || ctx.in_flight() > 0);
    ctx.raise_stop();

    let mut last = (ctx.seeds().len(), ctx.sink_occupancy());
    let mut growth = Vec::new();
    while !handle.is_finished() {
        let now = (ctx.seeds().len(), ctx.sink_occupancy());
        if now.0 > last.0 || now.1 > last.1 {
            growth.push((last, now));
        }
        last = now;
    }
    let report = handle.join().unwrap().unwrap();

    assert!(growth.is_empty(), "queues grew after stop: {:?}", growth);
    assert!(!ctx.enqueue_seed(Seed::new("late")));
    assert!(ctx.seeds().is_empty());
    assert_eq!(ctx.sink_occupancy(), 0);
    assert_eq!(ctx.in_flight(), 0);
    assert_eq!(report.unsettled_writes, 0);
}

#[test]
fn test_unavailable_store_during_acknowledgment_still_stops() {
    let store = Arc::new(MemorySeedStore::with_seeds(["a"]));
    let extractor = {
        let store = Arc::clone(&store);
        move |_: &Seed| -> Vec<anyhow::Result<Yield>> {
            // The worker's acknowledgment right after this attempt fails
            store.set_unavailable(true);
            outcome(true)
        }
    };
    let coordinator = Coordinator::new(config(3, 10, "finite"), store.clone(), Arc::new(extractor))
        .with_sink("articles", Arc::new(RecordingSink::default()));
    let ctx = coordinator.context();
    let handle = thread::spawn(move || coordinator.run());

    let deadline = Instant::now() + Duration::from_secs(5);
    while ctx.deferred_writes() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(ctx.deferred_writes(), 1);
    thread::sleep(Duration::from_millis(100));
    assert!(!ctx.is_stopped());

    store.set_unavailable(false);
    let report = handle.join().unwrap().unwrap();

    assert_eq!(store.ack_count("a"), 1);
    assert_eq!(store.total_occupancy().unwrap(), 0);
    assert_eq!(report.unsettled_writes, 0);
    assert_eq!(report.counters.succeeded, 1);
}

#[test]
fn test_sqlite_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteSeedStore::new(&dir.path().join("seeds.db"), Duration::from_secs(30)).unwrap(),
    );
    let sink = Arc::new(SqliteSink::new(&dir.path().join("items.db")).unwrap());
    let payloads: Vec<String> = (0..20).map(|n| format!("{{\"n\": {}}}", n)).collect();

    let report = Coordinator::new(
        config(3, 4, "finite"),
        store.clone(),
        Arc::new(Passthrough::new("articles")),
    )
    .with_source(Arc::new(IterSource::new(payloads)))
    .with_sink("articles", sink.clone())
    .run()
    .unwrap();

    assert_eq!(report.counters.succeeded, 20);
    assert_eq!(sink.count_by_destination().unwrap().get("articles"), Some(&20));
    assert_eq!(store.total_occupancy().unwrap(), 0);
    assert!(store.get_latest_run().unwrap().is_none());
}
