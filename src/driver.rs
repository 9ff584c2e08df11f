//! Batch driver: the boundary between the event source and the engine.
//!
//! For each batch the driver folds the records (retrying transient faults
//! with backoff), durably records the batch as committed together with the
//! dates whose snapshots need publishing, and then publishes those dates with
//! an independent retry budget. A batch whose aggregation already committed is
//! never folded again; only its pending publication is retried.

use crate::commit::{BatchCommitRecord, BatchPhase};
use crate::decoder::RawRecord;
use crate::engine::{AggregationEngine, BatchOutcome, EngineError};
use crate::publish::{PublishError, PublishedLocation, SnapshotPublisher};
use crate::retry::RetryPolicy;
use crate::store::{StoreError, bounded};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, error, info, warn};

/// Receives batches that will not succeed without operator attention.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn dead(&self, partition: &str, reason: &str);
}

/// Reports dead batches as error events on the `alerts` log target.
pub struct LogAlertSink;

#[async_trait::async_trait]
impl AlertSink for LogAlertSink {
    async fn dead(&self, partition: &str, reason: &str) {
        error!(target: "alerts", partition, reason, "Batch is dead");
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub aggregate_retry: RetryPolicy,
    pub publish_retry: RetryPolicy,
    /// Bound on commit record reads and writes.
    pub store_timeout: Duration,
    /// Time budget for folding one batch, measured from when it is received.
    pub batch_deadline: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            aggregate_retry: RetryPolicy::default(),
            publish_retry: RetryPolicy::default(),
            store_timeout: Duration::from_secs(5),
            batch_deadline: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("batch for partition {expected} contains a record from partition {found}")]
    MixedPartitions { expected: String, found: String },
    #[error("aggregation for partition {partition} failed after {attempts} attempt(s): {source}")]
    Aggregation {
        partition: String,
        attempts: u32,
        source: EngineError,
    },
    #[error("publishing {date} for partition {partition} failed after {attempts} attempt(s): {source}")]
    Publication {
        partition: String,
        date: NaiveDate,
        attempts: u32,
        source: PublishError,
    },
    #[error("commit record for partition {partition} unavailable: {source}")]
    Commit {
        partition: String,
        source: StoreError,
    },
    #[error("worker for partition {partition} stopped without a result: {reason}")]
    WorkerLost { partition: String, reason: String },
}

/// What one driven batch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverReport {
    pub partition: String,
    /// `None` when the batch had already been committed and was not folded again.
    pub outcome: Option<BatchOutcome>,
    pub aggregation_attempts: u32,
    pub published: Vec<PublishedLocation>,
}

pub struct BatchDriver {
    engine: Arc<AggregationEngine>,
    publisher: Arc<SnapshotPublisher>,
    alerts: Arc<dyn AlertSink>,
    config: DriverConfig,
}

impl BatchDriver {
    pub fn new(
        engine: Arc<AggregationEngine>,
        publisher: Arc<SnapshotPublisher>,
        alerts: Arc<dyn AlertSink>,
        config: DriverConfig,
    ) -> Self {
        Self {
            engine,
            publisher,
            alerts,
            config,
        }
    }

    /// Drives one batch of records from `partition`.
    #[tracing::instrument(skip_all, fields(partition = %partition, records = records.len()))]
    pub async fn drive(
        &self,
        partition: &str,
        records: &[RawRecord],
    ) -> Result<DriverReport, DriverError> {
        if let Some(stray) = records.iter().find(|r| r.partition != partition) {
            return Err(DriverError::MixedPartitions {
                expected: partition.to_string(),
                found: stray.partition.clone(),
            });
        }
        let deadline = self.config.batch_deadline.map(|budget| Instant::now() + budget);

        let (outcome, aggregation_attempts) = self
            .aggregate_with_retry(partition, records, deadline)
            .await?;
        let published = self.publish_pending(partition).await?;

        Ok(DriverReport {
            partition: partition.to_string(),
            outcome,
            aggregation_attempts,
            published,
        })
    }

    /// Drives `batches` in order, stopping at the first failure.
    ///
    /// Later batches must not run after a failed one: their sequence numbers
    /// would raise the high-water marks past the failed records.
    pub async fn drive_partition(
        &self,
        partition: &str,
        batches: Vec<Vec<RawRecord>>,
    ) -> Result<Vec<DriverReport>, DriverError> {
        let mut reports = Vec::with_capacity(batches.len());
        for batch in batches {
            reports.push(self.drive(partition, &batch).await?);
        }
        Ok(reports)
    }

    /// Runs one worker per partition, at most `concurrency` at a time.
    pub async fn drive_all(
        self: Arc<Self>,
        partitions: BTreeMap<String, Vec<Vec<RawRecord>>>,
        concurrency: usize,
    ) -> BTreeMap<String, Result<Vec<DriverReport>, DriverError>> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut workers = JoinSet::new();
        let expected: Vec<String> = partitions.keys().cloned().collect();

        for (partition, batches) in partitions {
            let driver = self.clone();
            let semaphore = semaphore.clone();
            let span = tracing::info_span!("partition_worker", partition = %partition);

            workers.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = driver.drive_partition(&partition, batches).await;
                    (partition, result)
                }
                .instrument(span),
            );
        }

        let mut results = BTreeMap::new();
        let mut lost = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((partition, result)) => {
                    results.insert(partition, result);
                }
                Err(e) => {
                    error!(error = %e, "Partition worker panicked");
                    lost.push(e.to_string());
                }
            }
        }

        let reason = lost.join("; ");
        for partition in expected {
            if !results.contains_key(&partition) {
                results.insert(
                    partition.clone(),
                    Err(DriverError::WorkerLost {
                        partition,
                        reason: reason.clone(),
                    }),
                );
            }
        }
        results
    }

    /// Loads the commit record of `partition`, refusing one that belongs to
    /// another partition.
    async fn load_commit(&self, partition: &str) -> Result<Option<BatchCommitRecord>, StoreError> {
        let store = self.engine.store();
        match bounded(self.config.store_timeout, store.load_commit(partition)).await? {
            Some(record) if record.partition != partition => Err(StoreError::Corrupt {
                location: format!("commit record of partition {partition}"),
                reason: format!("record belongs to partition {}", record.partition),
            }),
            record => Ok(record),
        }
    }

    async fn aggregate_with_retry(
        &self,
        partition: &str,
        records: &[RawRecord],
        deadline: Option<Instant>,
    ) -> Result<(Option<BatchOutcome>, u32), DriverError> {
        let policy = self.config.aggregate_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.aggregate_once(partition, records, deadline).await {
                Ok(outcome) => return Ok((outcome, attempt)),
                Err(e) => e,
            };

            let wait = policy.backoff(attempt);
            let fits_deadline =
                deadline.is_none_or(|d| Instant::now().checked_add(wait).is_some_and(|t| t < d));
            if err.is_transient() && policy.should_retry(attempt) && fits_deadline {
                warn!(
                    attempt,
                    backoff_ms = wait.as_millis() as u64,
                    error = %err,
                    "Batch aggregation failed, retrying"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            self.mark_failed(partition).await;
            let out_of_time = matches!(err, EngineError::DeadlineExceeded { .. })
                || (err.is_transient() && !fits_deadline);
            let failure = DriverError::Aggregation {
                partition: partition.to_string(),
                attempts: attempt,
                source: err,
            };
            if out_of_time {
                warn!(error = %failure, "Batch abandoned at deadline, leaving it for redelivery");
            } else {
                self.alerts.dead(partition, &failure.to_string()).await;
            }
            return Err(failure);
        }
    }

    async fn aggregate_once(
        &self,
        partition: &str,
        records: &[RawRecord],
        deadline: Option<Instant>,
    ) -> Result<Option<BatchOutcome>, EngineError> {
        let (Some(first), Some(last)) = (
            records.iter().map(|r| &r.sequence_number).min(),
            records.iter().map(|r| &r.sequence_number).max(),
        ) else {
            return Ok(Some(BatchOutcome::default()));
        };
        let limit = self.config.store_timeout;
        let store = self.engine.store();

        let mut record = self
            .load_commit(partition)
            .await?
            .unwrap_or_else(|| BatchCommitRecord::new(partition, first.clone(), last.clone()));

        if record.covers(last) {
            info!(last_sequence = %last, "Batch already committed, skipping aggregation");
            return Ok(None);
        }

        record.begin(first.clone(), last.clone());
        bounded(limit, store.save_commit(&record)).await?;

        let outcome = self.engine.process_batch(records, deadline).await?;

        record.commit(outcome.event_dates.iter().copied());
        bounded(limit, store.save_commit(&record)).await?;
        info!(
            phase = ?BatchPhase::Committed,
            pending = record.pending_publish.len(),
            "Batch committed"
        );
        Ok(Some(outcome))
    }

    async fn mark_failed(&self, partition: &str) {
        let limit = self.config.store_timeout;
        let store = self.engine.store();
        let result = async {
            if let Some(mut record) = self.load_commit(partition).await? {
                if record.phase == BatchPhase::Applying {
                    record.fail();
                    bounded(limit, store.save_commit(&record)).await?;
                }
            }
            Ok::<_, StoreError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Could not record batch failure");
        }
    }

    /// Publishes every date still pending for `partition`, dropping each from
    /// the commit record once its snapshot is written.
    async fn publish_pending(&self, partition: &str) -> Result<Vec<PublishedLocation>, DriverError> {
        let limit = self.config.store_timeout;
        let store = self.engine.store();
        let commit_err = |source| DriverError::Commit {
            partition: partition.to_string(),
            source,
        };

        let Some(mut record) = self.load_commit(partition).await.map_err(commit_err)?
        else {
            return Ok(Vec::new());
        };

        let pending: Vec<NaiveDate> = record.pending_publish.iter().copied().collect();
        let mut published = Vec::with_capacity(pending.len());
        for date in pending {
            published.push(self.publish_with_retry(partition, date).await?);
            record.published(date);
            bounded(limit, store.save_commit(&record))
                .await
                .map_err(commit_err)?;
        }
        Ok(published)
    }

    async fn publish_with_retry(
        &self,
        partition: &str,
        date: NaiveDate,
    ) -> Result<PublishedLocation, DriverError> {
        let policy = self.config.publish_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.publisher.publish(date).await {
                Ok(location) => return Ok(location),
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    let wait = policy.backoff(attempt);
                    warn!(
                        %date,
                        attempt,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "Snapshot publish failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    let failure = DriverError::Publication {
                        partition: partition.to_string(),
                        date,
                        attempts: attempt,
                        source: e,
                    };
                    self.alerts.dead(partition, &failure.to_string()).await;
                    return Err(failure);
                }
            }
        }
    }
}
