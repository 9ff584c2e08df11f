use chrono::NaiveDate;
use fare_kpi::backfill::{scan_table, store_scan};
use fare_kpi::commit::{BatchCommitRecord, BatchPhase};
use fare_kpi::decoder::RawRecord;
use fare_kpi::driver::{AlertSink, BatchDriver, DriverConfig, DriverError};
use fare_kpi::engine::{AggregationEngine, EngineConfig, EngineError};
use fare_kpi::publish::{LocalDirSink, MemorySink, SnapshotPublisher, SnapshotSink};
use fare_kpi::retry::RetryPolicy;
use fare_kpi::rollup::{DailyRollup, FareTotals};
use fare_kpi::source::split_batches;
use fare_kpi::store::{CasOutcome, FileRollupStore, MemoryRollupStore, RollupStore, StoreError};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn dec(text: &str) -> Decimal {
    Decimal::from_str(text).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn trip_image(id: &str, pickup: &str, fare: Value) -> Value {
    json!({
        "trip_id": id,
        "pickup_datetime": pickup,
        "fare_amount": fare,
        "estimated_fare_amount": fare,
    })
}

fn trip(partition: &str, seq: u64, pickup: &str, fare: Value) -> RawRecord {
    RawRecord::insert(
        partition,
        seq,
        trip_image(&format!("{partition}-{seq}"), pickup, fare),
    )
}

fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        2,
        Duration::from_millis(1),
        Some(Duration::from_millis(5)),
    )
}

fn config(aggregate_attempts: u32, publish_attempts: u32) -> DriverConfig {
    DriverConfig {
        aggregate_retry: quick_retry(aggregate_attempts),
        publish_retry: quick_retry(publish_attempts),
        store_timeout: Duration::from_secs(1),
        batch_deadline: None,
    }
}

#[derive(Default)]
struct RecordingAlerts {
    dead: Mutex<Vec<(String, String)>>,
}

impl RecordingAlerts {
    fn count(&self) -> usize {
        self.dead.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl AlertSink for RecordingAlerts {
    async fn dead(&self, partition: &str, reason: &str) {
        self.dead
            .lock()
            .unwrap()
            .push((partition.to_string(), reason.to_string()));
    }
}

/// Memory store whose conditional writes fail for a window of calls.
struct FlakyStore {
    inner: MemoryRollupStore,
    cas_calls: AtomicUsize,
    fail_from: usize,
    fail_count: usize,
}

impl FlakyStore {
    fn new(fail_from: usize, fail_count: usize) -> Self {
        Self {
            inner: MemoryRollupStore::new(),
            cas_calls: AtomicUsize::new(0),
            fail_from,
            fail_count,
        }
    }
}

#[async_trait::async_trait]
impl RollupStore for FlakyStore {
    async fn load(&self, date: NaiveDate) -> Result<DailyRollup, StoreError> {
        self.inner.load(date).await
    }

    async fn compare_and_swap(&self, rollup: &DailyRollup) -> Result<CasOutcome, StoreError> {
        let call = self.cas_calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.fail_from && call - self.fail_from < self.fail_count {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        self.inner.compare_and_swap(rollup).await
    }

    async fn dates(&self) -> Result<Vec<NaiveDate>, StoreError> {
        self.inner.dates().await
    }

    async fn load_commit(&self, partition: &str) -> Result<Option<BatchCommitRecord>, StoreError> {
        self.inner.load_commit(partition).await
    }

    async fn save_commit(&self, record: &BatchCommitRecord) -> Result<(), StoreError> {
        self.inner.save_commit(record).await
    }
}

/// Memory store that keeps a single commit record for every partition.
#[derive(Default)]
struct SharedCommitSlot {
    inner: MemoryRollupStore,
    commit: Mutex<Option<BatchCommitRecord>>,
}

#[async_trait::async_trait]
impl RollupStore for SharedCommitSlot {
    async fn load(&self, date: NaiveDate) -> Result<DailyRollup, StoreError> {
        self.inner.load(date).await
    }

    async fn compare_and_swap(&self, rollup: &DailyRollup) -> Result<CasOutcome, StoreError> {
        self.inner.compare_and_swap(rollup).await
    }

    async fn dates(&self) -> Result<Vec<NaiveDate>, StoreError> {
        self.inner.dates().await
    }

    async fn load_commit(&self, _: &str) -> Result<Option<BatchCommitRecord>, StoreError> {
        Ok(self.commit.lock().unwrap().clone())
    }

    async fn save_commit(&self, record: &BatchCommitRecord) -> Result<(), StoreError> {
        *self.commit.lock().unwrap() = Some(record.clone());
        Ok(())
    }
}

/// Memory store that panics when the commit record of one partition is read.
struct PanicsOnCommit {
    inner: MemoryRollupStore,
    partition: &'static str,
}

#[async_trait::async_trait]
impl RollupStore for PanicsOnCommit {
    async fn load(&self, date: NaiveDate) -> Result<DailyRollup, StoreError> {
        self.inner.load(date).await
    }

    async fn compare_and_swap(&self, rollup: &DailyRollup) -> Result<CasOutcome, StoreError> {
        self.inner.compare_and_swap(rollup).await
    }

    async fn dates(&self) -> Result<Vec<NaiveDate>, StoreError> {
        self.inner.dates().await
    }

    async fn load_commit(&self, partition: &str) -> Result<Option<BatchCommitRecord>, StoreError> {
        if partition == self.partition {
            panic!("commit record of {partition} is unreadable");
        }
        self.inner.load_commit(partition).await
    }

    async fn save_commit(&self, record: &BatchCommitRecord) -> Result<(), StoreError> {
        self.inner.save_commit(record).await
    }
}

struct Harness {
    store: Arc<dyn RollupStore>,
    sink: Arc<MemorySink>,
    alerts: Arc<RecordingAlerts>,
    driver: Arc<BatchDriver>,
}

fn harness(store: Arc<dyn RollupStore>, config: DriverConfig) -> Harness {
    let sink = Arc::new(MemorySink::new());
    let alerts = Arc::new(RecordingAlerts::default());
    let publisher = Arc::new(SnapshotPublisher::new(
        store.clone(),
        sink.clone(),
        "",
        Duration::from_secs(1),
    ));
    let engine = Arc::new(AggregationEngine::new(store.clone(), EngineConfig::default()));
    let driver = Arc::new(BatchDriver::new(
        engine,
        publisher,
        alerts.clone(),
        config,
    ));
    Harness {
        store,
        sink,
        alerts,
        driver,
    }
}

fn snapshot_text(sink: &MemorySink, date: &str) -> String {
    let body = sink
        .get(&format!("kpis/date={date}/kpi.json"))
        .expect("snapshot published");
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_concurrent_partitions_merge_into_one_rollup() {
    let h = harness(Arc::new(MemoryRollupStore::new()), config(3, 3));

    let mut records = Vec::new();
    for shard in 0..4 {
        let partition = format!("shard-{shard}");
        for seq in 1..=10u64 {
            let pickup = if seq % 2 == 0 {
                "2024-01-15T08:00:00Z"
            } else {
                "2024-01-16T08:00:00Z"
            };
            records.push(trip(&partition, seq, pickup, json!(seq * 2)));
        }
    }
    let partitions = split_batches(records, 3);
    let results = h.driver.clone().drive_all(partitions, 4).await;

    assert_eq!(results.len(), 4);
    assert!(results.values().all(Result::is_ok));

    // Per shard: 4 + 8 + 12 + 16 + 20 on even sequences, 2 + 6 + 10 + 14 + 18 on odd.
    let even = h.store.load(day(15)).await.unwrap();
    assert_eq!(even.totals.trip_count, 20);
    assert_eq!(even.totals.total_fare, Decimal::from(240));
    assert_eq!(even.high_water.len(), 4);

    let odd = h.store.load(day(16)).await.unwrap();
    assert_eq!(odd.totals.trip_count, 20);
    assert_eq!(odd.totals.total_fare, Decimal::from(200));

    assert_eq!(
        snapshot_text(&h.sink, "2024-01-15"),
        r#"{"date":"2024-01-15","trip_count":20,"total_fare":240.0,"average_fare":12.0,"max_fare":20.0,"min_fare":4.0}"#
    );
    assert_eq!(
        snapshot_text(&h.sink, "2024-01-16"),
        r#"{"date":"2024-01-16","trip_count":20,"total_fare":200.0,"average_fare":10.0,"max_fare":18.0,"min_fare":2.0}"#
    );
    assert_eq!(h.alerts.count(), 0);
}

#[tokio::test]
async fn test_redelivered_batches_do_not_double_count() {
    let h = harness(Arc::new(MemoryRollupStore::new()), config(3, 3));
    let batch = vec![
        trip("p0", 1, "2024-01-15T08:00:00Z", json!("10.00")),
        trip("p0", 2, "2024-01-15T09:00:00Z", json!("20.00")),
    ];

    let first = h.driver.drive("p0", &batch).await.unwrap();
    assert_eq!(first.outcome.map(|o| o.applied), Some(2));

    let again = h.driver.drive("p0", &batch).await.unwrap();
    assert_eq!(again.outcome, None);
    assert!(again.published.is_empty());

    let rollup = h.store.load(day(15)).await.unwrap();
    assert_eq!(rollup.totals.trip_count, 2);
    assert_eq!(rollup.totals.total_fare, Decimal::from(30));
}

#[tokio::test]
async fn test_bulk_scan_matches_streamed_totals() {
    let rows = vec![
        trip_image("a", "2024-01-15T08:30:00Z", json!("12.50")),
        trip_image("b", "2024-01-15T23:59:59Z", json!("7.25")),
        trip_image("c", "2024-01-16T00:00:00Z", json!("40")),
        json!({"trip_id": "d", "pickup_datetime": "2024-01-16T01:00:00Z", "estimated_fare_amount": 9}),
        trip_image("e", "2024-01-16T02:00:00Z", json!("-3.00")),
        trip_image("f", "2024-01-17T02:00:00Z", json!(0)),
    ];

    let h = harness(Arc::new(MemoryRollupStore::new()), config(3, 3));
    let stream: Vec<RawRecord> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| RawRecord::insert("stream", i as u64 + 1, row.clone()))
        .collect();
    let report = h.driver.drive("stream", &stream).await.unwrap();
    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.applied, 4);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.errors, 1);

    let scan = scan_table(
        rows.into_iter()
            .map(|row| row.as_object().unwrap().clone()),
    );
    assert_eq!(scan.totals.len(), 3);
    for (date, totals) in &scan.totals {
        let streamed = h.store.load(*date).await.unwrap();
        assert_eq!(&streamed.totals, totals, "totals differ for {date}");
    }
}

#[tokio::test]
async fn test_backfill_then_stream_skips_already_folded_records() {
    let store: Arc<dyn RollupStore> = Arc::new(MemoryRollupStore::new());
    let h = harness(store.clone(), config(3, 3));
    let batch = vec![trip("p0", 5, "2024-01-15T08:00:00Z", json!(10))];
    h.driver.drive("p0", &batch).await.unwrap();

    let scan = scan_table(vec![
        trip_image("p0-5", "2024-01-15T08:00:00Z", json!(10))
            .as_object()
            .unwrap()
            .clone(),
        trip_image("x", "2024-01-15T09:00:00Z", json!(30))
            .as_object()
            .unwrap()
            .clone(),
    ]);
    let dates = store_scan(store.as_ref(), &scan, Duration::from_secs(1), 8)
        .await
        .unwrap();
    assert_eq!(dates, vec![day(15)]);

    let rollup = store.load(day(15)).await.unwrap();
    assert_eq!(rollup.totals.trip_count, 2);
    assert_eq!(rollup.totals.total_fare, Decimal::from(40));

    // The stream mark survives the backfill, so a late redelivery is ignored.
    let engine = AggregationEngine::new(store.clone(), EngineConfig::default());
    let outcome = engine.process_batch(&batch, None).await.unwrap();
    assert_eq!(outcome.duplicates, 1);
    assert_eq!(store.load(day(15)).await.unwrap().totals.trip_count, 2);
}

#[tokio::test]
async fn test_publish_failure_is_retried_without_refolding() {
    let h = harness(Arc::new(MemoryRollupStore::new()), config(3, 1));
    h.sink.fail_next(1);
    let batch = vec![trip("p0", 1, "2024-01-15T08:00:00Z", json!("15.00"))];

    let err = h.driver.drive("p0", &batch).await.unwrap_err();
    assert!(matches!(err, DriverError::Publication { attempts: 1, .. }));
    assert_eq!(h.alerts.count(), 1);
    assert!(h.sink.keys().is_empty());

    let commit = h.store.load_commit("p0").await.unwrap().unwrap();
    assert_eq!(commit.phase, BatchPhase::Committed);
    assert!(commit.pending_publish.contains(&day(15)));

    let report = h.driver.drive("p0", &batch).await.unwrap();
    assert_eq!(report.outcome, None);
    assert_eq!(report.published.len(), 1);
    assert_eq!(h.store.load(day(15)).await.unwrap().totals.trip_count, 1);
    assert_eq!(
        snapshot_text(&h.sink, "2024-01-15"),
        r#"{"date":"2024-01-15","trip_count":1,"total_fare":15.0,"average_fare":15.0,"max_fare":15.0,"min_fare":15.0}"#
    );

    let commit = h.store.load_commit("p0").await.unwrap().unwrap();
    assert!(commit.pending_publish.is_empty());
}

#[tokio::test]
async fn test_transient_store_faults_are_retried() {
    let h = harness(Arc::new(FlakyStore::new(0, 2)), config(5, 3));
    let batch = vec![trip("p0", 1, "2024-01-15T08:00:00Z", json!(8))];

    let report = h.driver.drive("p0", &batch).await.unwrap();
    assert_eq!(report.aggregation_attempts, 3);
    assert_eq!(h.store.load(day(15)).await.unwrap().totals.trip_count, 1);
    assert_eq!(h.alerts.count(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_mark_the_batch_dead() {
    let h = harness(Arc::new(FlakyStore::new(0, usize::MAX)), config(3, 3));
    let batch = vec![trip("p0", 1, "2024-01-15T08:00:00Z", json!(8))];

    let err = h.driver.drive("p0", &batch).await.unwrap_err();
    assert!(matches!(err, DriverError::Aggregation { attempts: 3, .. }));

    let alerts = h.alerts.dead.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, "p0");

    let commit = h.store.load_commit("p0").await.unwrap().unwrap();
    assert_eq!(commit.phase, BatchPhase::Failed);
    assert_eq!(commit.committed_through, None);
    assert!(h.sink.keys().is_empty());
}

#[tokio::test]
async fn test_partial_failure_converges_on_redelivery() {
    // The second date's write fails once; the first date is already folded.
    let h = harness(Arc::new(FlakyStore::new(1, 1)), config(1, 3));
    let batch = vec![
        trip("p0", 1, "2024-01-15T08:00:00Z", json!(10)),
        trip("p0", 2, "2024-01-16T08:00:00Z", json!(20)),
        trip("p0", 3, "2024-01-15T09:00:00Z", json!(30)),
    ];

    assert!(h.driver.drive("p0", &batch).await.is_err());
    assert_eq!(h.store.load(day(15)).await.unwrap().totals.trip_count, 2);
    assert_eq!(h.store.load(day(16)).await.unwrap().totals.trip_count, 0);

    let report = h.driver.drive("p0", &batch).await.unwrap();
    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.duplicates, 2);

    let mut expected = FareTotals::default();
    expected.add(Decimal::from(10)).unwrap();
    expected.add(Decimal::from(30)).unwrap();
    assert_eq!(h.store.load(day(15)).await.unwrap().totals, expected);
    assert_eq!(h.store.load(day(16)).await.unwrap().totals.trip_count, 1);
    assert_eq!(report.published.len(), 2);
}

#[tokio::test]
async fn test_later_batches_wait_for_a_failed_one() {
    let h = harness(Arc::new(FlakyStore::new(0, 1)), config(1, 3));
    let batches = vec![
        vec![trip("p0", 1, "2024-01-15T08:00:00Z", json!(10))],
        vec![trip("p0", 2, "2024-01-15T09:00:00Z", json!(20))],
    ];

    assert!(h.driver.drive_partition("p0", batches.clone()).await.is_err());
    assert_eq!(h.store.load(day(15)).await.unwrap().totals.trip_count, 0);

    let reports = h.driver.drive_partition("p0", batches).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(h.store.load(day(15)).await.unwrap().totals.trip_count, 2);
}

#[tokio::test]
async fn test_filtered_and_invalid_records_never_count() {
    let h = harness(Arc::new(MemoryRollupStore::new()), config(3, 3));
    let completed = trip_image("done", "2024-01-15T08:00:00Z", json!(11));
    let batch = vec![
        trip("p0", 1, "2024-01-15T08:00:00Z", json!("12.00")),
        RawRecord {
            event_name: Some("MODIFY".into()),
            old_image: Some(completed.clone()),
            ..RawRecord::insert("p0", 2u64, completed.clone())
        },
        RawRecord {
            event_name: Some("REMOVE".into()),
            new_image: None,
            old_image: Some(completed),
            ..RawRecord::insert("p0", 3u64, Value::Null)
        },
        RawRecord::insert(
            "p0",
            4u64,
            json!({"trip_id": "open", "pickup_datetime": "2024-01-15T10:00:00Z", "fare_amount": {"N": "9.00"}}),
        ),
        trip("p0", 5, "2024-01-15T08:00:00Z", json!(-1)),
        trip("p0", 6, "not a timestamp", json!(5)),
    ];

    let outcome = h.driver.drive("p0", &batch).await.unwrap().outcome.unwrap();
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.skipped, 3);
    assert_eq!(outcome.errors, 2);

    let rollup = h.store.load(day(15)).await.unwrap();
    assert_eq!(rollup.totals.trip_count, 1);
    assert_eq!(rollup.totals.min_fare, Some(dec("12")));
    assert_eq!(rollup.totals.max_fare, Some(dec("12")));
}

#[tokio::test]
async fn test_file_store_end_to_end() {
    let state = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();

    let store: Arc<dyn RollupStore> = Arc::new(FileRollupStore::open(state.path()).await.unwrap());
    let sink: Arc<dyn SnapshotSink> = Arc::new(LocalDirSink::new(out.path()));
    let publisher = Arc::new(SnapshotPublisher::new(
        store.clone(),
        sink,
        "athena",
        Duration::from_secs(1),
    ));
    let engine = Arc::new(AggregationEngine::new(store.clone(), EngineConfig::default()));
    let driver = Arc::new(BatchDriver::new(
        engine,
        publisher,
        Arc::new(RecordingAlerts::default()),
        config(3, 3),
    ));

    let fares = ["10.00", "20.00", "30.00", "25.50"];
    let records: Vec<RawRecord> = fares
        .iter()
        .enumerate()
        .map(|(i, fare)| trip("shard-a", i as u64 + 1, "2024-01-15T12:00:00Z", json!(fare)))
        .collect();
    let mut partitions = BTreeMap::new();
    partitions.insert("shard-a".to_string(), vec![records[..2].to_vec(), records[2..].to_vec()]);
    let results = driver.drive_all(partitions, 2).await;
    assert!(results["shard-a"].is_ok());

    let written = std::fs::read_to_string(
        out.path()
            .join("athena/kpis/date=2024-01-15/kpi.json"),
    )
    .unwrap();
    assert_eq!(
        written,
        r#"{"date":"2024-01-15","trip_count":4,"total_fare":85.5,"average_fare":21.38,"max_fare":30.0,"min_fare":10.0}"#
    );

    let reopened = FileRollupStore::open(state.path()).await.unwrap();
    assert_eq!(reopened.dates().await.unwrap(), vec![day(15)]);
    let commit = reopened.load_commit("shard-a").await.unwrap().unwrap();
    assert_eq!(commit.phase, BatchPhase::Committed);
    assert!(commit.pending_publish.is_empty());
}

#[tokio::test]
async fn test_batch_mixing_partitions_is_rejected() {
    let h = harness(Arc::new(MemoryRollupStore::new()), config(3, 3));
    let batch = vec![
        trip("p0", 1, "2024-01-15T08:00:00Z", json!(10)),
        trip("p1", 2, "2024-01-15T09:00:00Z", json!(20)),
    ];

    let err = h.driver.drive("p0", &batch).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::MixedPartitions { ref expected, ref found } if expected == "p0" && found == "p1"
    ));
    assert_eq!(h.alerts.count(), 0);
    assert!(h.store.load_commit("p0").await.unwrap().is_none());
    assert_eq!(h.store.load(day(15)).await.unwrap().totals.trip_count, 0);
}

#[tokio::test]
async fn test_backoff_past_deadline_leaves_batch_for_redelivery() {
    let mut config = config(5, 3);
    config.aggregate_retry = RetryPolicy::new(5, 2, Duration::from_secs(10), None);
    config.batch_deadline = Some(Duration::from_secs(1));
    let h = harness(Arc::new(FlakyStore::new(0, 1)), config);
    let batch = vec![trip("p0", 1, "2024-01-15T08:00:00Z", json!(8))];

    let err = h.driver.drive("p0", &batch).await.unwrap_err();
    assert!(matches!(err, DriverError::Aggregation { attempts: 1, .. }));
    assert_eq!(h.alerts.count(), 0);
    let commit = h.store.load_commit("p0").await.unwrap().unwrap();
    assert_eq!(commit.phase, BatchPhase::Failed);

    let report = h.driver.drive("p0", &batch).await.unwrap();
    assert_eq!(report.outcome.map(|o| o.applied), Some(1));
    assert_eq!(report.published.len(), 1);
    assert_eq!(h.store.load(day(15)).await.unwrap().totals.trip_count, 1);
    assert_eq!(h.alerts.count(), 0);
}

#[tokio::test]
async fn test_expired_deadline_fails_without_alert_then_converges() {
    let store: Arc<dyn RollupStore> = Arc::new(MemoryRollupStore::new());
    let mut expired = config(3, 3);
    expired.batch_deadline = Some(Duration::ZERO);
    let h = harness(store.clone(), expired);
    let batch = vec![
        trip("p0", 1, "2024-01-15T08:00:00Z", json!(10)),
        trip("p0", 2, "2024-01-16T08:00:00Z", json!(20)),
    ];

    let err = h.driver.drive("p0", &batch).await.unwrap_err();
    assert!(matches!(err, DriverError::Aggregation { .. }));
    assert_eq!(h.alerts.count(), 0);
    assert_eq!(store.load(day(15)).await.unwrap().totals.trip_count, 0);

    let redelivery = harness(store.clone(), config(3, 3));
    let report = redelivery.driver.drive("p0", &batch).await.unwrap();
    assert_eq!(report.outcome.map(|o| o.applied), Some(2));
    assert_eq!(store.load(day(15)).await.unwrap().totals.trip_count, 1);
    assert_eq!(store.load(day(16)).await.unwrap().totals.trip_count, 1);
    assert_eq!(redelivery.alerts.count(), 0);
}

#[tokio::test]
async fn test_similar_partition_names_do_not_share_progress() {
    let state = tempfile::tempdir().unwrap();
    let store: Arc<dyn RollupStore> = Arc::new(FileRollupStore::open(state.path()).await.unwrap());
    let h = harness(store.clone(), config(3, 3));

    let first: Vec<RawRecord> = (1..=3u64)
        .map(|seq| trip("shard:1", seq, "2024-01-15T08:00:00Z", json!(10)))
        .collect();
    h.driver.drive("shard:1", &first).await.unwrap();

    let second = vec![trip("shard_1", 1, "2024-01-15T09:00:00Z", json!(7))];
    let report = h.driver.drive("shard_1", &second).await.unwrap();
    assert_eq!(report.outcome.map(|o| o.applied), Some(1));

    let rollup = store.load(day(15)).await.unwrap();
    assert_eq!(rollup.totals.trip_count, 4);
    assert_eq!(rollup.totals.total_fare, Decimal::from(37));
}

#[tokio::test]
async fn test_commit_record_of_another_partition_is_refused() {
    let h = harness(Arc::new(SharedCommitSlot::default()), config(3, 3));
    h.driver
        .drive("p0", &[trip("p0", 9, "2024-01-15T08:00:00Z", json!(10))])
        .await
        .unwrap();

    let err = h
        .driver
        .drive("p1", &[trip("p1", 1, "2024-01-16T08:00:00Z", json!(5))])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DriverError::Aggregation { attempts: 1, source: EngineError::Store(StoreError::Corrupt { .. }), .. }
    ));
    assert_eq!(h.alerts.count(), 1);
    assert_eq!(h.store.load(day(16)).await.unwrap().totals.trip_count, 0);
}

#[tokio::test]
async fn test_overflowing_fare_does_not_stop_the_partition() {
    let h = harness(Arc::new(MemoryRollupStore::new()), config(3, 3));
    let huge = "50000000000000000000000000000";
    let mut partitions = BTreeMap::new();
    partitions.insert(
        "p0".to_string(),
        vec![vec![
            trip("p0", 1, "2024-01-15T08:00:00Z", json!(huge)),
            trip("p0", 2, "2024-01-15T09:00:00Z", json!(huge)),
        ]],
    );
    partitions.insert(
        "p1".to_string(),
        vec![vec![trip("p1", 1, "2024-01-16T08:00:00Z", json!(10))]],
    );

    let results = h.driver.clone().drive_all(partitions, 2).await;
    assert_eq!(results.len(), 2);
    let p0 = results["p0"].as_ref().unwrap();
    let outcome = p0[0].outcome.as_ref().unwrap();
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.errors, 1);
    assert!(results["p1"].is_ok());

    let rollup = h.store.load(day(15)).await.unwrap();
    assert_eq!(rollup.totals.trip_count, 1);
    assert_eq!(rollup.totals.total_fare, dec(huge));
}

#[tokio::test]
async fn test_panicking_worker_is_reported_for_its_partition() {
    let store = PanicsOnCommit {
        inner: MemoryRollupStore::new(),
        partition: "p0",
    };
    let h = harness(Arc::new(store), config(3, 3));
    let mut partitions = BTreeMap::new();
    partitions.insert(
        "p0".to_string(),
        vec![vec![trip("p0", 1, "2024-01-15T08:00:00Z", json!(10))]],
    );
    partitions.insert(
        "p1".to_string(),
        vec![vec![trip("p1", 1, "2024-01-16T08:00:00Z", json!(10))]],
    );

    let results = h.driver.clone().drive_all(partitions, 2).await;
    assert_eq!(results.len(), 2);
    assert!(matches!(
        results["p0"],
        Err(DriverError::WorkerLost { ref partition, .. }) if partition == "p0"
    ));
    assert!(results["p1"].is_ok());
    assert_eq!(h.store.load(day(16)).await.unwrap().totals.trip_count, 1);
}
